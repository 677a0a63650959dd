//! Poll-mode collection and observe fallback.

use std::time::Duration;

use cairn_collector::{CollectMode, Collector, CollectorConfig, DeviceSpec};
use cairn_core::{CollectorEvent, ReadingValue};
use cairn_harness::{SimDevice, SimEnv, SimTransport};
use tokio::sync::mpsc;

fn float_of(event: &CollectorEvent) -> f64 {
    match event {
        CollectorEvent::Reading(reading) => match reading.value {
            ReadingValue::Float(v) => v,
            ref other => panic!("unexpected reading value: {other:?}"),
        },
        CollectorEvent::Error(error) => panic!("unexpected error event: {error:?}"),
    }
}

async fn collect(
    collector: Collector<SimEnv, SimTransport>,
    rx: &mut mpsc::Receiver<CollectorEvent>,
    count: usize,
) -> Vec<CollectorEvent> {
    let mut events = Vec::new();
    tokio::select! {
        _ = collector.run() => {},
        () = async {
            while events.len() < count {
                match rx.recv().await {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
        } => {},
    }
    events
}

#[test]
fn poll_mode_collects_on_the_interval() {
    let mut sim =
        turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("mote", || async {
        let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
        SimDevice::new("dh/tmp")
            .without_observe()
            .reading(0, "19.0")
            .reading(0, "19.5")
            .reading(0, "20.0")
            .serve(socket)
            .await
    });

    sim.client("collector", async {
        let transport = SimTransport::bind("0.0.0.0:5682").await?;
        let (tx, mut rx) = mpsc::channel(64);
        let config = CollectorConfig {
            devices: vec![DeviceSpec {
                device_id: Some("bench".into()),
                address: (turmoil::lookup("mote"), 5683).into(),
                resource: "dh/tmp".into(),
                mode: CollectMode::Poll,
                poll_interval_secs: Some(10),
            }],
            ..Default::default()
        };

        let collector = Collector::new(SimEnv::new(23), transport, config, tx);
        let events = collect(collector, &mut rx, 3).await;

        let values: Vec<f64> = events.iter().map(float_of).collect();
        assert_eq!(values, vec![19.0, 19.5, 20.0]);

        for event in &events {
            let CollectorEvent::Reading(reading) = event else { continue };
            assert_eq!(reading.device_id, "bench");
        }
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn observe_falls_back_to_polling_when_unsupported() {
    let mut sim =
        turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("mote", || async {
        let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
        SimDevice::new("dh/tmp")
            .without_observe()
            .reading(0, "21.0")
            .reading(0, "21.5")
            .reading(0, "22.0")
            .serve(socket)
            .await
    });

    sim.client("collector", async {
        let transport = SimTransport::bind("0.0.0.0:5682").await?;
        let (tx, mut rx) = mpsc::channel(64);
        let config = CollectorConfig {
            devices: vec![DeviceSpec {
                device_id: Some("mote-a".into()),
                address: (turmoil::lookup("mote"), 5683).into(),
                resource: "dh/tmp".into(),
                mode: CollectMode::Observe,
                poll_interval_secs: Some(10),
            }],
            ..Default::default()
        };

        let collector = Collector::new(SimEnv::new(31), transport, config, tx);
        let events = collect(collector, &mut rx, 3).await;

        // The registration answer had no Observe option: its payload is
        // still a reading, and collection continues by polling.
        let values: Vec<f64> = events.iter().map(float_of).collect();
        assert_eq!(values, vec![21.0, 21.5, 22.0]);
        Ok(())
    });

    sim.run().unwrap();
}
