//! Deterministic simulation harness for the Cairn collector.
//!
//! Turmoil-based implementations of the `Environment` and `Transport`
//! traits plus a scripted CoAP device, enabling deterministic,
//! reproducible testing of the collector under packet loss, duplication,
//! and silence.
//!
//! # Why Deterministic Simulation?
//!
//! The collector's hard cases are timing races over a lossy socket:
//! an acknowledgement racing a retry timer, duplicated notification
//! deliveries, observations going silent. Against a real network these
//! only reproduce occasionally; under turmoil the clock is virtual and
//! the RNG seeded, so a failing seed replays exactly.
//!
//! # Example
//!
//! ```rust,ignore
//! use cairn_harness::{SimDevice, SimEnv, SimTransport};
//! use turmoil::Builder;
//!
//! #[test]
//! fn observe_happy_path() {
//!     let mut sim = Builder::new().build();
//!
//!     sim.host("mote", || async {
//!         let socket = turmoil::net::UdpSocket::bind("0.0.0.0:5683").await?;
//!         SimDevice::new("dh/tmp").reading(1, "21.0").serve(socket).await
//!     });
//!
//!     sim.client("collector", async {
//!         // drive a real Collector against the mote...
//!         Ok(())
//!     });
//!
//!     sim.run().unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod sim_device;
mod sim_env;
mod sim_transport;

pub use sim_device::SimDevice;
pub use sim_env::SimEnv;
pub use sim_transport::SimTransport;
