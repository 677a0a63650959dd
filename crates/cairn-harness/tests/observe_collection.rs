//! End-to-end observe collection scenarios.
//!
//! A real `Collector` runs inside a turmoil simulation against a scripted
//! mote; assertions are made on the event stream the sink would consume.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use cairn_collector::{CollectMode, Collector, CollectorConfig, DeviceSpec};
use cairn_core::{CollectorEvent, ReadingValue};
use cairn_harness::{SimDevice, SimEnv, SimTransport};
use tokio::sync::mpsc;

/// Drive the collector until `count` events arrived (or the channel
/// closed). Dropping the run future cancels all device tasks.
async fn collect_events(
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

fn reading_value(event: &CollectorEvent) -> f64 {
    match event {
        CollectorEvent::Reading(reading) => match reading.value {
            ReadingValue::Float(v) => v,
            ref other => panic!("unexpected reading value: {other:?}"),
        },
        CollectorEvent::Error(error) => panic!("unexpected error event: {error:?}"),
    }
}

#[test]
fn observe_collects_ordered_readings() {
    let mut sim =
        turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("mote", || async {
        let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
        SimDevice::new("dh/tmp")
            .reading(1, "21.0")
            .reading(2, "21.5")
            .reading(3, "22.0")
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
                poll_interval_secs: None,
            }],
            ..Default::default()
        };

        let collector = Collector::new(SimEnv::new(42), transport, config, tx);
        let events = collect_events(collector, &mut rx, 3).await;

        assert_eq!(events.len(), 3, "expected three readings, got {events:?}");
        for event in &events {
            let CollectorEvent::Reading(reading) = event else {
                panic!("unexpected error event: {event:?}");
            };
            assert_eq!(reading.device_id, "mote-a");
            assert_eq!(reading.resource_path, "dh/tmp");
        }

        let values: Vec<f64> = events.iter().map(reading_value).collect();
        assert_eq!(values, vec![21.0, 21.5, 22.0]);

        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn timestamps_are_monotonic_per_device() {
    let mut sim =
        turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("mote", || async {
        let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
        SimDevice::new("dh/tmp")
            .reading(10, "1.0")
            .reading(11, "2.0")
            .reading(12, "3.0")
            .serve(socket)
            .await
    });

    sim.client("collector", async {
        let transport = SimTransport::bind("0.0.0.0:5682").await?;
        let (tx, mut rx) = mpsc::channel(64);
        let config = CollectorConfig {
            devices: vec![DeviceSpec {
                device_id: None,
                address: (turmoil::lookup("mote"), 5683).into(),
                resource: "dh/tmp".into(),
                mode: CollectMode::Observe,
                poll_interval_secs: None,
            }],
            ..Default::default()
        };

        let collector = Collector::new(SimEnv::new(7), transport, config, tx);
        let events = collect_events(collector, &mut rx, 3).await;

        let timestamps: Vec<u64> = events
            .iter()
            .map(|event| match event {
                CollectorEvent::Reading(reading) => reading.timestamp_ms,
                CollectorEvent::Error(error) => panic!("unexpected error: {error:?}"),
            })
            .collect();

        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]), "timestamps: {timestamps:?}");
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn same_seed_reproduces_the_event_stream() {
    let mut streams: Vec<Vec<CollectorEvent>> = Vec::new();

    for _ in 0..2 {
        let mut sim = turmoil::Builder::new()
            .simulation_duration(Duration::from_secs(120))
            .rng_seed(12345)
            .build();

        sim.host("mote", || async {
            let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
            SimDevice::new("dh/tmp")
                .reading(1, "21.0")
                .reading(2, "21.5")
                .reading(3, "22.0")
                .serve(socket)
                .await
        });

        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = Arc::clone(&captured);

        sim.client("collector", async move {
            let transport = SimTransport::bind("0.0.0.0:5682").await?;
            let (tx, mut rx) = mpsc::channel(64);
            let config = CollectorConfig {
                devices: vec![DeviceSpec {
                    device_id: None,
                    address: (turmoil::lookup("mote"), 5683).into(),
                    resource: "dh/tmp".into(),
                    mode: CollectMode::Observe,
                    poll_interval_secs: None,
                }],
                ..Default::default()
            };

            let collector = Collector::new(SimEnv::new(99), transport, config, tx);
            let events = collect_events(collector, &mut rx, 3).await;
            captured_clone.lock().expect("mutex poisoned").extend(events);
            Ok(())
        });

        sim.run().unwrap();
        let events = captured.lock().expect("mutex poisoned").clone();
        streams.push(events);
    }

    assert_eq!(streams[0], streams[1], "same seed must reproduce the exact event stream");
}
