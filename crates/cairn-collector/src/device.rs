//! Per-device collection task.
//!
//! Each configured (or announced) device runs one of these tasks. The
//! task drives the full collect cycle for its peer: register an observe
//! relationship (or poll on an interval), ride the retransmission state
//! machine for every confirmable request, judge notification sequence
//! numbers, and emit readings/errors to the sink channel.
//!
//! Inbound messages reach the task through its routed channel; the
//! `select!` arms are biased so an acknowledgement that raced a retry
//! timer is always consumed first and the exchange reaches exactly one
//! terminal outcome.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use cairn_core::{
    Backoff, CollectionError, CollectionErrorKind, CollectorEvent, Environment, NotificationVerdict,
    Observation, Reading, RetryState, RetryStep, TransactionTracker, TransmissionParams, Transport,
    decode_payload,
};
use cairn_proto::{Code, Message, MessageKind, MessageOption, numbers};
use tokio::{sync::mpsc, time::Instant};

use crate::{Routed, Router, lock, send_datagram};

/// How one collect cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Channel closed; the orchestrator is shutting the task down.
    Shutdown,
    /// Cycle completed (poll done, or observation needs re-registering);
    /// start the next cycle without penalty.
    Continue,
    /// Registration response carried no Observe option; the peer does
    /// not support observe for this resource.
    SwitchToPoll,
    /// Cycle failed; counts against the failure budget.
    Failed(CollectionErrorKind),
}

/// Result of driving one confirmable request to a terminal outcome.
#[derive(Debug)]
enum RequestOutcome {
    /// Response content (piggybacked or separate).
    Response(Message),
    /// Channel closed mid-exchange.
    Shutdown,
    /// Retransmissions exhausted, or the separate response never came.
    TimedOut,
    /// Peer sent Reset.
    Reset,
}

/// State and handles for one device's collection loop.
pub(crate) struct DeviceTask<E: Environment, T: Transport> {
    pub env: E,
    pub transport: Arc<T>,
    pub tracker: Arc<Mutex<TransactionTracker>>,
    pub router: Router,
    pub events: mpsc::Sender<CollectorEvent>,
    pub params: TransmissionParams,
    pub liveness_window: Duration,
    pub failure_budget: u32,
    pub backoff: Backoff,
    pub device_id: String,
    pub peer: SocketAddr,
    pub resource: String,
    pub mode: crate::config::CollectMode,
    pub poll_interval: Duration,
    /// Grace period before the first request; announced devices get a
    /// settle delay so a mote finishing boot is not hit immediately.
    pub initial_delay: Duration,
}

/// Releases the device's tracker state and route when the task ends for
/// any reason, including cancellation.
struct PeerGuard {
    tracker: Arc<Mutex<TransactionTracker>>,
    router: Router,
    peer: SocketAddr,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        lock(&self.tracker).release_peer(self.peer);
        lock(&self.router).remove(&self.peer);
        tracing::debug!(peer = %self.peer, "released device state");
    }
}

impl<E: Environment, T: Transport> DeviceTask<E, T> {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Routed>) {
        let _guard = PeerGuard {
            tracker: Arc::clone(&self.tracker),
            router: Arc::clone(&self.router),
            peer: self.peer,
        };

        if !self.initial_delay.is_zero() {
            self.env.sleep(self.initial_delay).await;
        }

        tracing::info!(device = %self.device_id, peer = %self.peer, resource = %self.resource,
            mode = ?self.mode, "collecting");

        let mut failures: u32 = 0;
        let mut had_observation = false;

        loop {
            let outcome = match self.mode {
                crate::config::CollectMode::Observe => {
                    self.observe_cycle(&mut rx, &mut had_observation).await
                },
                crate::config::CollectMode::Poll => self.poll_cycle(&mut rx).await,
            };

            match outcome {
                CycleOutcome::Shutdown => return,

                CycleOutcome::Continue => {
                    failures = 0;
                    self.backoff.reset();
                },

                CycleOutcome::SwitchToPoll => {
                    tracing::warn!(device = %self.device_id,
                        "peer does not support observe, falling back to polling");
                    self.mode = crate::config::CollectMode::Poll;
                },

                CycleOutcome::Failed(kind) => {
                    if kind == CollectionErrorKind::Rejected {
                        // Peer explicitly refused; stay off this resource
                        // until reconfiguration.
                        self.emit_error(kind).await;
                        tracing::warn!(device = %self.device_id, "peer rejected collection, stopping");
                        return;
                    }

                    failures += 1;
                    if failures >= self.failure_budget {
                        self.emit_error(kind).await;
                        failures = 0;
                    }

                    let delay = self.backoff.next_delay();
                    tracing::debug!(device = %self.device_id, ?delay, "backing off after failure");
                    if !self.wait_out(&mut rx, self.env.now() + delay).await {
                        return;
                    }
                },
            }
        }
    }

    /// Register an observation and consume notifications until the cycle
    /// ends.
    async fn observe_cycle(
        &mut self,
        rx: &mut mpsc::Receiver<Routed>,
        had_observation: &mut bool,
    ) -> CycleOutcome {
        let Some(mut request) = self.get_request() else {
            return CycleOutcome::Failed(CollectionErrorKind::Rejected);
        };
        if let Ok(observe) = MessageOption::uint(numbers::OBSERVE, 0) {
            request.push_option(observe);
        }

        let response = match self.send_request(rx, request).await {
            RequestOutcome::Response(msg) => msg,
            RequestOutcome::Shutdown => return CycleOutcome::Shutdown,
            RequestOutcome::Reset => return CycleOutcome::Failed(CollectionErrorKind::Rejected),
            RequestOutcome::TimedOut => {
                let kind = if *had_observation {
                    CollectionErrorKind::ObserveLost
                } else {
                    CollectionErrorKind::Timeout
                };
                return CycleOutcome::Failed(kind);
            },
        };

        if !response.code.is_success() {
            tracing::warn!(device = %self.device_id, code = %response.code,
                "registration refused");
            return CycleOutcome::Failed(CollectionErrorKind::Rejected);
        }

        let Some(sequence) = response.observe() else {
            // Valid reading, but no observation was established.
            self.emit_reading(&response).await;
            return CycleOutcome::SwitchToPoll;
        };

        let token = response.token;
        lock(&self.tracker).reserve_token(self.peer, token);
        *had_observation = true;

        let mut observation =
            Observation::establish(self.peer, self.resource.clone(), token, sequence, self.env.now());
        tracing::info!(device = %self.device_id, sequence, %token, "observation established");
        self.emit_reading(&response).await;

        let outcome = self.notification_loop(rx, &mut observation).await;
        lock(&self.tracker).release_token(self.peer, token);
        outcome
    }

    /// Consume notifications for an established observation.
    async fn notification_loop(
        &mut self,
        rx: &mut mpsc::Receiver<Routed>,
        observation: &mut Observation,
    ) -> CycleOutcome {
        loop {
            let deadline = observation.liveness_deadline(self.liveness_window);

            tokio::select! {
                biased;

                routed = rx.recv() => {
                    let Some(routed) = routed else { return CycleOutcome::Shutdown };
                    match routed {
                        // No exchange is open during the notification
                        // phase; a late-matched message is stale.
                        Routed::Matched { .. } => {},
                        Routed::Notification { message } => {
                            if let Some(outcome) =
                                self.handle_notification(observation, message).await
                            {
                                return outcome;
                            }
                        },
                    }
                },

                () = self.env.sleep_until(deadline) => {
                    observation.degrade();
                    tracing::warn!(device = %self.device_id,
                        "observation silent past liveness window, re-registering");
                    return CycleOutcome::Continue;
                },
            }
        }
    }

    /// Process one notification; `Some` ends the cycle.
    async fn handle_notification(
        &mut self,
        observation: &mut Observation,
        message: Message,
    ) -> Option<CycleOutcome> {
        if message.token != observation.token() {
            // Not ours (old registration still chattering); tell the peer
            // to stop.
            if message.kind == MessageKind::Confirmable {
                send_datagram(&*self.transport, self.peer, &Message::reset(message.message_id))
                    .await;
            }
            return None;
        }

        // Acknowledge before app-layer judgement; even stale deliveries
        // were received.
        if message.kind == MessageKind::Confirmable {
            send_datagram(&*self.transport, self.peer, &Message::ack(message.message_id)).await;
        }

        if !message.code.is_success() {
            tracing::warn!(device = %self.device_id, code = %message.code,
                "peer ended observation with error");
            return Some(CycleOutcome::Failed(CollectionErrorKind::Rejected));
        }

        match message.observe() {
            Some(sequence) => match observation.on_notification(sequence, self.env.now()) {
                NotificationVerdict::Accepted => {
                    self.emit_reading(&message).await;
                    None
                },
                NotificationVerdict::Stale => {
                    tracing::debug!(device = %self.device_id, sequence,
                        last = observation.last_sequence(), "discarding stale notification");
                    None
                },
            },
            None => {
                // A response without the Observe option carries the final
                // representation and ends the relationship.
                self.emit_reading(&message).await;
                tracing::info!(device = %self.device_id, "observation ended by peer, re-registering");
                Some(CycleOutcome::Continue)
            },
        }
    }

    /// One poll: confirmable GET, reading, then wait out the interval.
    async fn poll_cycle(&mut self, rx: &mut mpsc::Receiver<Routed>) -> CycleOutcome {
        let Some(request) = self.get_request() else {
            return CycleOutcome::Failed(CollectionErrorKind::Rejected);
        };

        let response = match self.send_request(rx, request).await {
            RequestOutcome::Response(msg) => msg,
            RequestOutcome::Shutdown => return CycleOutcome::Shutdown,
            RequestOutcome::Reset => return CycleOutcome::Failed(CollectionErrorKind::Rejected),
            RequestOutcome::TimedOut => return CycleOutcome::Failed(CollectionErrorKind::Timeout),
        };

        if !response.code.is_success() {
            tracing::warn!(device = %self.device_id, code = %response.code, "poll refused");
            return CycleOutcome::Failed(CollectionErrorKind::Rejected);
        }

        self.emit_reading(&response).await;

        if self.wait_out(rx, self.env.now() + self.poll_interval).await {
            CycleOutcome::Continue
        } else {
            CycleOutcome::Shutdown
        }
    }

    /// Build the GET request for the collected resource.
    fn get_request(&self) -> Option<Message> {
        let mut request = Message::new(MessageKind::Confirmable, Code::GET, 0);
        match request.set_uri_path(&self.resource) {
            Ok(()) => Some(request),
            Err(e) => {
                tracing::error!(device = %self.device_id, resource = %self.resource,
                    "unusable resource path: {}", e);
                None
            },
        }
    }

    /// Drive one confirmable request to a terminal outcome, retransmitting
    /// on the backoff schedule. The inbound arm is polled before the
    /// timer arm, so a delivered acknowledgement always beats a pending
    /// retry.
    async fn send_request(
        &mut self,
        rx: &mut mpsc::Receiver<Routed>,
        mut request: Message,
    ) -> RequestOutcome {
        let exchange = match lock(&self.tracker).register(&self.env, self.peer) {
            Ok(exchange) => exchange,
            Err(e) => {
                // Transient by contract; the device backoff retries it.
                tracing::warn!(device = %self.device_id, "identifier allocation failed: {}", e);
                return RequestOutcome::TimedOut;
            },
        };

        request.message_id = exchange.message_id;
        request.token = exchange.token;

        let bytes = match request.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(device = %self.device_id, "request does not encode: {}", e);
                lock(&self.tracker).close(exchange.id);
                return RequestOutcome::Reset;
            },
        };

        if let Err(e) = self.transport.send_to(&bytes, self.peer).await {
            tracing::warn!(device = %self.device_id, "send failed: {}", e);
        }

        let mut retry = RetryState::start(&self.env, &self.params);
        let mut response_deadline: Option<Instant> = None;

        loop {
            let deadline = match retry.deadline().or(response_deadline) {
                Some(deadline) => deadline,
                None => {
                    lock(&self.tracker).close(exchange.id);
                    return RequestOutcome::TimedOut;
                },
            };

            tokio::select! {
                biased;

                routed = rx.recv() => {
                    let Some(routed) = routed else {
                        lock(&self.tracker).close(exchange.id);
                        return RequestOutcome::Shutdown;
                    };

                    match routed {
                        Routed::Matched { exchange: id, message } if id == exchange.id => {
                            match message.kind {
                                MessageKind::Acknowledgement => {
                                    retry.acknowledge();
                                    if message.code.is_empty() {
                                        // Separate response to follow.
                                        response_deadline = Some(
                                            self.env.now() + self.params.exchange_lifetime,
                                        );
                                    } else {
                                        lock(&self.tracker).close(exchange.id);
                                        return RequestOutcome::Response(message);
                                    }
                                },
                                MessageKind::Reset => {
                                    retry.reject();
                                    lock(&self.tracker).close(exchange.id);
                                    return RequestOutcome::Reset;
                                },
                                MessageKind::Confirmable | MessageKind::NonConfirmable => {
                                    // Separate response, matched by token.
                                    if message.kind == MessageKind::Confirmable {
                                        send_datagram(
                                            &*self.transport,
                                            self.peer,
                                            &Message::ack(message.message_id),
                                        )
                                        .await;
                                    }
                                    retry.acknowledge();
                                    lock(&self.tracker).close(exchange.id);
                                    return RequestOutcome::Response(message);
                                },
                            }
                        },

                        // A different (stale) exchange of ours; drop.
                        Routed::Matched { .. } => {},

                        Routed::Notification { message } => {
                            // Old-token notification racing a
                            // re-registration; reject it.
                            if message.kind == MessageKind::Confirmable {
                                send_datagram(
                                    &*self.transport,
                                    self.peer,
                                    &Message::reset(message.message_id),
                                )
                                .await;
                            }
                        },
                    }
                },

                () = self.env.sleep_until(deadline) => {
                    if retry.deadline().is_none() {
                        // The separate response never arrived.
                        lock(&self.tracker).close(exchange.id);
                        return RequestOutcome::TimedOut;
                    }

                    match retry.on_deadline(self.env.now()) {
                        Some(RetryStep::Retransmit { .. }) => {
                            tracing::debug!(device = %self.device_id,
                                attempt = retry.attempts(), "retransmitting");
                            if let Err(e) = self.transport.send_to(&bytes, self.peer).await {
                                tracing::warn!(device = %self.device_id, "retransmit failed: {}", e);
                            }
                        },
                        Some(RetryStep::TimedOut) => {
                            lock(&self.tracker).close(exchange.id);
                            return RequestOutcome::TimedOut;
                        },
                        None => {},
                    }
                },
            }
        }
    }

    /// Sleep until `deadline`, still answering strays. Returns false on
    /// shutdown.
    async fn wait_out(&self, rx: &mut mpsc::Receiver<Routed>, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                biased;

                routed = rx.recv() => {
                    let Some(routed) = routed else { return false };
                    self.handle_stray(routed).await;
                },

                () = self.env.sleep_until(deadline) => return true,
            }
        }
    }

    /// Reject confirmable messages that arrive while no exchange or
    /// observation is live.
    async fn handle_stray(&self, routed: Routed) {
        if let Routed::Notification { message } = routed
            && message.kind == MessageKind::Confirmable
        {
            send_datagram(&*self.transport, self.peer, &Message::reset(message.message_id)).await;
        }
    }

    async fn emit_reading(&self, message: &Message) {
        let value = decode_payload(message.content_format(), &message.payload);
        tracing::info!(device = %self.device_id, code = %message.code, value = ?value,
            "reading accepted");

        let reading = Reading {
            device_id: self.device_id.clone(),
            resource_path: self.resource.clone(),
            value,
            timestamp_ms: self.env.unix_millis(),
        };

        if self.events.send(CollectorEvent::Reading(reading)).await.is_err() {
            tracing::debug!("event sink closed");
        }
    }

    async fn emit_error(&self, kind: CollectionErrorKind) {
        tracing::warn!(device = %self.device_id, ?kind, "collection failing");

        let error = CollectionError {
            device_id: self.device_id.clone(),
            resource_path: self.resource.clone(),
            kind,
            timestamp_ms: self.env.unix_millis(),
        };

        if self.events.send(CollectorEvent::Error(error)).await.is_err() {
            tracing::debug!("event sink closed");
        }
    }
}
