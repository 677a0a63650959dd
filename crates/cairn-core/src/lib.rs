//! CoAP collection engine.
//!
//! The reliability and subscription layer between the wire codec
//! (`cairn-proto`) and the runtime (`cairn-collector`): exchange
//! tracking with duplicate suppression, confirmable-message
//! retransmission, observe-relationship state, and reading decode.
//!
//! ## Architecture
//!
//! ```text
//! cairn-core
//!   ├─ Environment         (time/sleep/randomness abstraction)
//!   ├─ Transport           (shared datagram socket trait)
//!   ├─ TransactionTracker  (dedup window + open exchange maps)
//!   ├─ RetryState          (per-exchange retransmission machine)
//!   ├─ Observation         (sequence reconciliation + liveness)
//!   └─ CollectorEvent      (readings/errors handed to the sink)
//! ```
//!
//! Everything here is runtime-agnostic: state machines take the current
//! time as an argument and return decisions; only driver code sleeps on
//! the `Environment`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod env;
pub mod exchange;
pub mod observe;
pub mod reading;
pub mod tracker;
pub mod transport;

pub use backoff::Backoff;
pub use env::Environment;
pub use exchange::{RetryOutcome, RetryState, RetryStep, TransmissionParams};
pub use observe::{
    NotificationVerdict, Observation, ObservationHealth, SEQUENCE_MODULUS, sequence_is_newer,
};
pub use reading::{
    CollectionError, CollectionErrorKind, CollectorEvent, Reading, ReadingValue, decode_payload,
};
pub use tracker::{ExchangeId, Inbound, OpenExchange, TrackerError, TransactionTracker};
pub use transport::Transport;
