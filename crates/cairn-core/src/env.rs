//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples the collection engine from system
//! resources (time, sleeping, randomness). This enables:
//!
//! - Deterministic simulation: turmoil provides a virtual clock and the
//!   harness a seeded RNG, allowing perfect bug reproduction of timing
//!   races (retry vs. acknowledgement, liveness expiry).
//!
//! - Production runtime: the tokio implementation uses real time and OS
//!   entropy without any change to the engine.
//!
//! # Invariants
//!
//! - Monotonicity: `now()` never goes backwards
//! - Determinism: given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: implementations must not share global state

use std::time::Duration;

use tokio::time::Instant;

/// Abstract environment providing time, sleeping, and randomness.
///
/// Uses `tokio::time::Instant` so that the same engine code observes the
/// virtual clock under simulation and the system clock in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time.
    ///
    /// # Invariants
    ///
    /// - Monotonicity: subsequent calls return times >= previous calls
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the unix epoch, used to stamp sink
    /// events. Simulation implementations derive this from virtual time so
    /// event timestamps are reproducible.
    fn unix_millis(&self) -> u64;

    /// Sleeps until the given deadline.
    ///
    /// This is the only async method in the trait; only driver code (not
    /// engine state machines) awaits it.
    fn sleep_until(&self, deadline: Instant) -> impl std::future::Future<Output = ()> + Send;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.sleep_until(self.now() + duration)
    }

    /// Fills the provided buffer with random bytes.
    ///
    /// Production implementations use OS entropy; simulation
    /// implementations use a seeded RNG and must log the seed for
    /// reproducibility.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u32`, used for message-id seeding and timeout
    /// jitter.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// A random value in `[0, 1)`, used to spread the initial
    /// retransmission timeout across its randomization window.
    fn random_unit(&self) -> f64 {
        f64::from(self.random_u32()) / (f64::from(u32::MAX) + 1.0)
    }
}
