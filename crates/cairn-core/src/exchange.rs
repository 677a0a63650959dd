//! Confirmable-exchange retransmission state machine.
//!
//! Per exchange: `AwaitingAck` until a matching acknowledgement or reset
//! arrives, retransmitting on a doubling timer up to `MAX_RETRANSMIT`
//! attempts, then `TimedOut`. At most one terminal transition is admitted;
//! later events against a terminal state are ignored. Non-confirmable
//! requests never enter this machine — they complete on send and any
//! response is matched opportunistically by token.

use std::time::Duration;

use tokio::time::Instant;

use crate::env::Environment;

/// CoAP transmission constants (RFC 7252 §4.8 defaults).
#[derive(Debug, Clone)]
pub struct TransmissionParams {
    /// Base acknowledgement timeout before the first retransmission.
    pub ack_timeout: Duration,
    /// Randomization factor applied to the initial timeout.
    pub ack_random_factor: f64,
    /// Maximum number of retransmissions before giving up.
    pub max_retransmit: u32,
    /// Window during which a repeated (peer, message-id) is a duplicate.
    pub exchange_lifetime: Duration,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
        }
    }
}

/// Terminal outcome of a confirmable exchange's reliability layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A matching acknowledgement arrived.
    Acked,
    /// The peer rejected the message with a Reset.
    Reset,
    /// All retransmissions elapsed unacknowledged.
    TimedOut,
}

/// What to do when the current retransmission deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Send the request again and re-arm the timer for the new deadline.
    Retransmit {
        /// Deadline for the next retransmission decision.
        deadline: Instant,
    },
    /// Retransmissions exhausted; the exchange is now `TimedOut`.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAck,
    Terminal(RetryOutcome),
}

/// Retransmission timer state for one confirmable exchange.
///
/// The caller owns the select loop; this type only decides what the timer
/// means when it fires and guarantees the at-most-one-terminal invariant.
#[derive(Debug, Clone)]
pub struct RetryState {
    phase: Phase,
    attempt: u32,
    timeout: Duration,
    deadline: Instant,
    max_retransmit: u32,
}

impl RetryState {
    /// Arm the timer for a freshly sent confirmable request.
    ///
    /// The initial timeout is drawn uniformly from
    /// `[ack_timeout, ack_timeout * ack_random_factor)` so concurrent
    /// exchanges do not synchronize their retries.
    pub fn start<E: Environment>(env: &E, params: &TransmissionParams) -> Self {
        let spread = (params.ack_random_factor - 1.0).max(0.0);
        let timeout = params.ack_timeout.mul_f64(1.0 + spread * env.random_unit());

        Self {
            phase: Phase::AwaitingAck,
            attempt: 0,
            timeout,
            deadline: env.now() + timeout,
            max_retransmit: params.max_retransmit,
        }
    }

    /// The deadline the caller should sleep until, or `None` once the
    /// exchange is terminal.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::AwaitingAck => Some(self.deadline),
            Phase::Terminal(_) => None,
        }
    }

    /// Advance the machine after the deadline fired.
    ///
    /// Each retransmission doubles the timeout, so successive intervals
    /// are monotonically non-decreasing. Returns `None` if the exchange
    /// already reached a terminal state (the ack won the race).
    pub fn on_deadline(&mut self, now: Instant) -> Option<RetryStep> {
        if self.phase != Phase::AwaitingAck {
            return None;
        }

        if self.attempt >= self.max_retransmit {
            self.phase = Phase::Terminal(RetryOutcome::TimedOut);
            return Some(RetryStep::TimedOut);
        }

        self.attempt += 1;
        self.timeout *= 2;
        self.deadline = now + self.timeout;
        Some(RetryStep::Retransmit { deadline: self.deadline })
    }

    /// Record a matching acknowledgement. Returns false if the exchange
    /// was already terminal (no second terminal transition).
    pub fn acknowledge(&mut self) -> bool {
        self.terminate(RetryOutcome::Acked)
    }

    /// Record a peer Reset. Returns false if the exchange was already
    /// terminal.
    pub fn reject(&mut self) -> bool {
        self.terminate(RetryOutcome::Reset)
    }

    fn terminate(&mut self, outcome: RetryOutcome) -> bool {
        if self.phase == Phase::AwaitingAck {
            self.phase = Phase::Terminal(outcome);
            true
        } else {
            false
        }
    }

    /// Terminal outcome, once reached.
    pub fn outcome(&self) -> Option<RetryOutcome> {
        match self.phase {
            Phase::AwaitingAck => None,
            Phase::Terminal(outcome) => Some(outcome),
        }
    }

    /// Number of retransmissions performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
