//! Per-device retry backoff.
//!
//! Distinct from per-message retransmission: when a device keeps failing
//! (exchanges time out, observations die), the device task waits out a
//! doubling delay before trying again so an unreachable device is never
//! hot-looped.

use std::time::Duration;

/// Exponential backoff with a ceiling, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: None }
    }

    /// Delay to wait before the next attempt; doubles on each call up to
    /// the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => (previous * 2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Clear accumulated backoff after a success.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));

        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
