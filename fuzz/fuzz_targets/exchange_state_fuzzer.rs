//! Fuzz target for the retransmission and observation state machines
//!
//! # Strategy
//!
//! - Event sequences: arbitrary interleavings of deadline firings, acks,
//!   resets, and notifications
//! - Time probing: arbitrary advances between events
//!
//! # Invariants
//!
//! - At most one terminal outcome per exchange; the outcome never changes
//!   after it is reached
//! - No more than MAX_RETRANSMIT retransmissions are ever requested
//! - Retransmission deadlines never move backwards
//! - An observation's last-seen sequence only ever moves to fresher
//!   values under the 24-bit wraparound rule

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use cairn_core::{
    Environment, NotificationVerdict, Observation, RetryState, RetryStep, TransmissionParams,
    sequence_is_newer,
};
use cairn_proto::Token;
use libfuzzer_sys::fuzz_target;
use tokio::time::Instant;

#[derive(Debug, Clone, Arbitrary)]
enum Event {
    DeadlineFires,
    Ack,
    Reset,
    Notification { sequence: u32 },
    Advance { millis: u16 },
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    rng_byte: u8,
    initial_sequence: u32,
    events: Vec<Event>,
}

#[derive(Clone)]
struct FuzzEnv {
    rng_byte: u8,
}

impl Environment for FuzzEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        0
    }

    fn sleep_until(&self, deadline: Instant) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep_until(deadline)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(self.rng_byte);
    }
}

fuzz_target!(|input: FuzzInput| {
    let env = FuzzEnv { rng_byte: input.rng_byte };
    let params = TransmissionParams::default();

    let mut retry = RetryState::start(&env, &params);
    let mut now = env.now();
    let mut retransmits: u32 = 0;
    let mut last_deadline = retry.deadline();
    let mut first_outcome = None;

    let token = Token::new(&[1, 2, 3, 4]).unwrap_or(Token::EMPTY);
    let peer = "127.0.0.1:5683".parse().unwrap();
    let mut observation =
        Observation::establish(peer, "dh/tmp", token, input.initial_sequence, now);

    for event in input.events {
        match event {
            Event::DeadlineFires => match retry.on_deadline(now) {
                Some(RetryStep::Retransmit { deadline }) => {
                    retransmits += 1;
                    assert!(
                        retransmits <= params.max_retransmit,
                        "retransmitted past the bound"
                    );
                    if let Some(previous) = last_deadline {
                        assert!(deadline >= previous, "deadline moved backwards");
                    }
                    last_deadline = Some(deadline);
                },
                Some(RetryStep::TimedOut) | None => {},
            },

            Event::Ack => {
                retry.acknowledge();
            },

            Event::Reset => {
                retry.reject();
            },

            Event::Notification { sequence } => {
                let before = observation.last_sequence();
                let verdict = observation.on_notification(sequence, now);
                match verdict {
                    NotificationVerdict::Accepted => {
                        assert!(
                            sequence_is_newer(before, sequence),
                            "accepted a non-fresh sequence {sequence} after {before}"
                        );
                    },
                    NotificationVerdict::Stale => {
                        assert_eq!(observation.last_sequence(), before, "stale mutated state");
                    },
                }
            },

            Event::Advance { millis } => {
                now += Duration::from_millis(u64::from(millis));
            },
        }

        if let Some(outcome) = retry.outcome() {
            match first_outcome {
                None => first_outcome = Some(outcome),
                Some(first) => assert_eq!(first, outcome, "terminal outcome changed"),
            }
        }
    }
});
