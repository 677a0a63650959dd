//! Production Environment implementation using system time and RNG.

use std::time::{SystemTime, UNIX_EPOCH};

use cairn_core::Environment;
use tokio::time::Instant;

/// Production environment backed by the tokio clock and OS entropy.
///
/// - `tokio::time::Instant` for monotonic time and deadlines
/// - `tokio::time::sleep_until` for suspension
/// - `getrandom` for message-id seeds, tokens, and retry jitter
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sleep_until(&self, deadline: Instant) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep_until(deadline)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).unwrap_or_else(|e| {
            // Should never fail on supported platforms. Identifier
            // collisions degrade matching but must not take the
            // collector down.
            tracing::error!("getrandom failed: {}", e);
            buffer.fill(0);
        });
    }
}
