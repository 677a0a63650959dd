//! Device announcement flow: a mote POSTs to the hello path and the
//! collector starts observing it without static configuration.

use std::time::Duration;

use cairn_collector::{Collector, CollectorConfig};
use cairn_core::{CollectorEvent, ReadingValue};
use cairn_harness::{SimDevice, SimEnv, SimTransport};
use cairn_proto::{Code, Message, MessageKind, Token};
use tokio::sync::mpsc;

#[test]
fn announced_device_is_collected() {
    let mut sim =
        turmoil::Builder::new().simulation_duration(Duration::from_secs(120)).build();

    sim.host("mote", || async {
        let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
        let collector_addr: std::net::SocketAddr = (turmoil::lookup("collector"), 5682).into();

        let mut hello = Message::new(MessageKind::Confirmable, Code::POST, 0x0101);
        hello.token = Token::new(&[0xAA])?;
        hello.set_uri_path("dh/lo")?;
        let hello_bytes = hello.encode()?;

        // Announce until acknowledged; duplicate deliveries are the
        // collector's problem to suppress.
        let mut buf = vec![0u8; 2048];
        loop {
            socket.send_to(&hello_bytes, collector_addr).await?;
            match tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if let Ok(reply) = Message::decode(&buf[..len])
                        && reply.kind == MessageKind::Acknowledgement
                        && reply.code == Code::CREATED
                    {
                        break;
                    }
                },
                _ => {},
            }
        }

        SimDevice::new("dh/tmp").reading(1, "25.0").reading(2, "25.5").serve(socket).await
    });

    sim.client("collector", async {
        let transport = SimTransport::bind("0.0.0.0:5682").await?;
        let (tx, mut rx) = mpsc::channel(64);
        let config = CollectorConfig {
            devices: Vec::new(),
            announce_path: Some("dh/lo".into()),
            ..Default::default()
        };

        let collector = Collector::new(SimEnv::new(61), transport, config, tx);

        let events = tokio::select! {
            _ = collector.run() => Vec::new(),
            events = async {
                let mut events = Vec::new();
                while events.len() < 2 {
                    match rx.recv().await {
                        Some(event) => events.push(event),
                        None => break,
                    }
                }
                events
            } => events,
        };

        assert_eq!(events.len(), 2, "expected two readings, got {events:?}");
        for (event, expected) in events.iter().zip([25.0, 25.5]) {
            let CollectorEvent::Reading(reading) = event else {
                panic!("unexpected error event: {event:?}");
            };
            assert!(reading.device_id.starts_with("mote-"), "derived id: {}", reading.device_id);
            assert_eq!(reading.resource_path, "dh/tmp");
            assert_eq!(reading.value, ReadingValue::Float(expected));
        }
        Ok(())
    });

    sim.run().unwrap();
}
