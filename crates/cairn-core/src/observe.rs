//! Observation state: sequence reconciliation and liveness.
//!
//! An observation is the long-lived registration created by a GET with
//! Observe 0. Notifications carry a 24-bit rolling sequence number; the
//! manager accepts fresher sequences (including wraparound within half the
//! counter range, per RFC 7641 §3.4), discards stale redeliveries, and
//! tracks liveness so a silent peer triggers re-registration.

use std::{net::SocketAddr, time::Duration};

use cairn_proto::Token;
use tokio::time::Instant;

/// Modulus of the notification sequence counter.
pub const SEQUENCE_MODULUS: u32 = 1 << 24;

/// Half the sequence space; gaps beyond this are regressions, not
/// wraparound.
const HALF_RANGE: u32 = 1 << 23;

/// Freshness of one notification relative to an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationVerdict {
    /// Sequence is fresher than the last accepted one; state advanced.
    Accepted,
    /// Reordered or replayed delivery; acknowledged but not surfaced.
    Stale,
}

/// Health of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationHealth {
    /// Notifications are flowing within the liveness window.
    Active,
    /// Liveness window elapsed without a notification; a fresh
    /// registration is in order.
    Degraded,
    /// Peer rejected a notification exchange or deregistration was
    /// requested; collection stays off until explicitly re-requested.
    Cancelled,
}

/// One live observe relationship, keyed by (peer, resource path).
#[derive(Debug, Clone)]
pub struct Observation {
    peer: SocketAddr,
    resource: String,
    token: Token,
    last_sequence: u32,
    last_notified_at: Instant,
    health: ObservationHealth,
}

impl Observation {
    /// Record a successfully established registration, seeded with the
    /// sequence number from the initial response.
    pub fn establish(
        peer: SocketAddr,
        resource: impl Into<String>,
        token: Token,
        initial_sequence: u32,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            resource: resource.into(),
            token,
            last_sequence: initial_sequence % SEQUENCE_MODULUS,
            last_notified_at: now,
            health: ObservationHealth::Active,
        }
    }

    /// Peer address this observation is registered against.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Observed resource path.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Token notifications for this observation carry.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Last accepted sequence number.
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Current health.
    pub fn health(&self) -> ObservationHealth {
        self.health
    }

    /// Judge a notification's sequence number and advance state if it is
    /// fresh. Accepting a notification also restores `Active` health and
    /// restarts the liveness window.
    pub fn on_notification(&mut self, sequence: u32, now: Instant) -> NotificationVerdict {
        let sequence = sequence % SEQUENCE_MODULUS;
        if !sequence_is_newer(self.last_sequence, sequence) {
            return NotificationVerdict::Stale;
        }

        self.last_sequence = sequence;
        self.last_notified_at = now;
        self.health = ObservationHealth::Active;
        NotificationVerdict::Accepted
    }

    /// Deadline by which the next notification must arrive.
    pub fn liveness_deadline(&self, window: Duration) -> Instant {
        self.last_notified_at + window
    }

    /// True once the liveness window has elapsed without a notification.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.last_notified_at) >= window
    }

    /// Mark the observation degraded (liveness lost); the caller
    /// re-registers with a fresh token.
    pub fn degrade(&mut self) {
        if self.health == ObservationHealth::Active {
            self.health = ObservationHealth::Degraded;
        }
    }

    /// Permanently cancel the observation for this resource.
    pub fn cancel(&mut self) {
        self.health = ObservationHealth::Cancelled;
    }
}

/// RFC 7641 freshness: `new` is fresher than `last` iff it is numerically
/// greater, or the wrap-adjusted gap is within half the counter range.
pub fn sequence_is_newer(last: u32, new: u32) -> bool {
    let last = last % SEQUENCE_MODULUS;
    let new = new % SEQUENCE_MODULUS;

    (last < new && new - last < HALF_RANGE) || (last > new && last - new > HALF_RANGE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "[fd00::1]:5683".parse().unwrap()
    }

    fn observation(initial: u32) -> Observation {
        let token = Token::new(&[1, 2, 3, 4]).unwrap();
        Observation::establish(peer(), "dh/tmp", token, initial, Instant::now())
    }

    #[test]
    fn accepts_ascending_discards_regression() {
        let mut obs = observation(5);
        let now = Instant::now();

        assert_eq!(obs.on_notification(6, now), NotificationVerdict::Accepted);
        assert_eq!(obs.on_notification(4, now), NotificationVerdict::Stale);
        assert_eq!(obs.on_notification(7, now), NotificationVerdict::Accepted);
        assert_eq!(obs.last_sequence(), 7);
    }

    #[test]
    fn equal_sequence_is_stale() {
        let mut obs = observation(9);
        assert_eq!(obs.on_notification(9, Instant::now()), NotificationVerdict::Stale);
    }

    #[test]
    fn wraparound_is_fresh() {
        // 2^24 - 1 wrapping to 0 is a gap of 1, well within tolerance.
        assert!(sequence_is_newer(SEQUENCE_MODULUS - 1, 0));
        assert!(sequence_is_newer(SEQUENCE_MODULUS - 10, 5));
        assert!(!sequence_is_newer(5, SEQUENCE_MODULUS - 10));
    }

    #[test]
    fn half_range_boundary() {
        assert!(sequence_is_newer(0, HALF_RANGE - 1));
        assert!(!sequence_is_newer(0, HALF_RANGE));
        assert!(!sequence_is_newer(0, HALF_RANGE + 1));
    }

    #[test]
    fn accepting_restores_health_and_liveness() {
        let mut obs = observation(1);
        let window = Duration::from_secs(120);

        obs.degrade();
        assert_eq!(obs.health(), ObservationHealth::Degraded);

        let later = Instant::now() + Duration::from_secs(200);
        assert!(obs.is_expired(later, window));

        assert_eq!(obs.on_notification(2, later), NotificationVerdict::Accepted);
        assert_eq!(obs.health(), ObservationHealth::Active);
        assert!(!obs.is_expired(later, window));
        assert_eq!(obs.liveness_deadline(window), later + window);
    }

    #[test]
    fn cancellation_is_permanent() {
        let mut obs = observation(1);
        obs.cancel();
        obs.degrade();
        assert_eq!(obs.health(), ObservationHealth::Cancelled);
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::*;

        proptest! {
            #[test]
            fn freshness_is_antisymmetric(
                a in 0u32..SEQUENCE_MODULUS,
                b in 0u32..SEQUENCE_MODULUS,
            ) {
                prop_assert!(!(sequence_is_newer(a, b) && sequence_is_newer(b, a)));
            }

            #[test]
            fn successor_is_always_fresh(a in 0u32..SEQUENCE_MODULUS) {
                prop_assert!(sequence_is_newer(a, (a + 1) % SEQUENCE_MODULUS));
            }

            #[test]
            fn nothing_is_fresher_than_itself(a in 0u32..SEQUENCE_MODULUS) {
                prop_assert!(!sequence_is_newer(a, a));
            }
        }
    }
}
