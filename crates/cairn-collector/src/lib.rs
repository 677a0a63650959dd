//! Cairn production collector runtime.
//!
//! This crate wires the collection engine (`cairn-core`) to real I/O:
//! a shared tokio UDP socket, system time and entropy, per-device tasks,
//! and the JSON-lines event sink.
//!
//! ## Architecture
//!
//! ```text
//! cairn-collector
//!   ├─ SystemEnv           (production Environment impl)
//!   ├─ UdpTransport        (shared tokio UDP socket)
//!   ├─ Collector           (orchestrator: dispatch + device tasks)
//!   │    ├─ dispatch loop  (decode, dedup, route by peer address)
//!   │    └─ DeviceTask ×N  (observe/poll cycles per device)
//!   ├─ JsonLinesSink       (event stream to stdout or file)
//!   └─ CollectorConfig     (device list + knobs from JSON)
//! ```
//!
//! A single dispatch loop owns the receive half of the socket and routes
//! classified messages to per-device tasks over mpsc channels; device
//! tasks share the send half freely. Cancelling the orchestrator (or one
//! device task) releases that device's tracked identifiers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod device;
mod error;
mod sink;
mod system_env;
mod transport;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use cairn_core::{
    Backoff, CollectorEvent, Environment, ExchangeId, Inbound, TransactionTracker, Transport,
};
use cairn_proto::{Code, Message, MessageKind};
use tokio::{sync::mpsc, task::JoinSet};

pub use config::{CollectMode, CollectorConfig, ConfigError, DeviceSpec, invariant_name};
pub use error::CollectorError;
pub use sink::{JsonLinesSink, run_sink};
pub use system_env::SystemEnv;
pub use transport::UdpTransport;

/// Settle delay before first contact with a freshly announced device.
const ANNOUNCE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Poll interval handed to announced devices if they turn out not to
/// support observe.
const ANNOUNCE_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Receive buffer size, comfortably above the default CoAP message size.
const RECV_BUFFER: usize = 2048;

/// Consecutive socket errors tolerated before the runtime gives up.
const MAX_SOCKET_ERRORS: u32 = 10;

/// Capacity of each device task's routed-message channel.
const DEVICE_CHANNEL: usize = 32;

/// Messages routed from the dispatch loop to a device task.
#[derive(Debug, Clone)]
pub(crate) enum Routed {
    /// Correlated to an open exchange of this device.
    Matched {
        /// The exchange the tracker matched.
        exchange: ExchangeId,
        /// The decoded message.
        message: Message,
    },
    /// Server-initiated message for this peer (observe notification or
    /// stray).
    Notification {
        /// The decoded message.
        message: Message,
    },
}

/// Route table from peer address to the owning device task.
pub(crate) type Router = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Routed>>>>;

/// Lock a mutex, riding over poisoning: a panicked task must not wedge
/// the other devices' access to shared maps.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode and send one message. Best-effort: failures are logged, the
/// reliability layer covers loss.
pub(crate) async fn send_datagram<T: Transport>(
    transport: &T,
    peer: SocketAddr,
    message: &Message,
) {
    match message.encode() {
        Ok(bytes) => {
            if let Err(e) = transport.send_to(&bytes, peer).await {
                tracing::warn!(%peer, "send failed: {}", e);
            }
        },
        Err(e) => tracing::error!(%peer, "message does not encode: {}", e),
    }
}

/// The collector orchestrator.
///
/// Owns the configured device set and drives one task per device plus the
/// shared dispatch loop. Dropping the future returned by [`Collector::run`]
/// cancels all device tasks and releases their tracked identifiers.
pub struct Collector<E: Environment, T: Transport> {
    env: E,
    transport: Arc<T>,
    config: CollectorConfig,
    events: mpsc::Sender<CollectorEvent>,
}

impl<E: Environment, T: Transport> Collector<E, T> {
    /// Create a collector over a bound transport. Events flow into the
    /// given channel in per-device order.
    pub fn new(
        env: E,
        transport: T,
        config: CollectorConfig,
        events: mpsc::Sender<CollectorEvent>,
    ) -> Self {
        Self { env, transport: Arc::new(transport), config, events }
    }

    /// Run the collector until the socket fails persistently.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Transport`] when the shared socket keeps
    /// failing; per-device failures never end the run.
    pub async fn run(self) -> Result<(), CollectorError> {
        let tracker = Arc::new(Mutex::new(TransactionTracker::new(
            &self.env,
            self.config.params.exchange_lifetime,
        )));
        let router: Router = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks: JoinSet<()> = JoinSet::new();

        for spec in self.config.devices.clone() {
            self.spawn_device(
                &mut tasks,
                &tracker,
                &router,
                spec.device_id(),
                spec.address,
                spec.resource.clone(),
                spec.mode,
                spec.poll_interval(),
                Duration::ZERO,
            );
        }

        if self.config.devices.is_empty() && self.config.announce_path.is_none() {
            tracing::warn!("no devices configured and announcements disabled; nothing to collect");
        }

        self.dispatch(&mut tasks, &tracker, &router).await
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_device(
        &self,
        tasks: &mut JoinSet<()>,
        tracker: &Arc<Mutex<TransactionTracker>>,
        router: &Router,
        device_id: String,
        peer: SocketAddr,
        resource: String,
        mode: CollectMode,
        poll_interval: Duration,
        initial_delay: Duration,
    ) {
        let (tx, rx) = mpsc::channel(DEVICE_CHANNEL);
        if lock(router).insert(peer, tx).is_some() {
            tracing::warn!(%peer, "replacing existing device route");
        }

        let task = device::DeviceTask {
            env: self.env.clone(),
            transport: Arc::clone(&self.transport),
            tracker: Arc::clone(tracker),
            router: Arc::clone(router),
            events: self.events.clone(),
            params: self.config.params.clone(),
            liveness_window: self.config.liveness_window(),
            failure_budget: self.config.failure_budget.max(1),
            backoff: Backoff::new(self.config.backoff_initial(), self.config.backoff_max()),
            device_id,
            peer,
            resource,
            mode,
            poll_interval,
            initial_delay,
        };

        tasks.spawn(task.run(rx));
    }

    /// Shared receive loop: decode, dedup, route by peer address.
    ///
    /// Malformed datagrams are dropped without disturbing the loop.
    async fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        tracker: &Arc<Mutex<TransactionTracker>>,
        router: &Router,
    ) -> Result<(), CollectorError> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut socket_errors: u32 = 0;

        loop {
            let (len, peer) = match self.transport.recv_from(&mut buf).await {
                Ok(received) => {
                    socket_errors = 0;
                    received
                },
                Err(e) => {
                    socket_errors += 1;
                    tracing::error!("socket receive failed: {}", e);
                    if socket_errors >= MAX_SOCKET_ERRORS {
                        return Err(CollectorError::Transport(format!(
                            "receive failing persistently: {e}"
                        )));
                    }
                    continue;
                },
            };

            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(%peer, len, "dropping malformed datagram: {}", e);
                    continue;
                },
            };

            let now = self.env.now();
            let verdict = {
                let mut tracker = lock(tracker);
                tracker.prune(now);
                tracker.on_inbound(peer, &message, now)
            };

            match verdict {
                Inbound::Duplicate => {
                    tracing::debug!(%peer, message_id = message.message_id, "duplicate delivery");
                    if message.kind == MessageKind::Confirmable {
                        // The ack for the first delivery may have been
                        // lost; repeat it so the peer stops resending.
                        send_datagram(&*self.transport, peer, &Message::ack(message.message_id))
                            .await;
                    }
                },

                Inbound::Matched(exchange) => {
                    let sender = lock(router).get(&peer).cloned();
                    match sender {
                        Some(tx) => {
                            if tx.try_send(Routed::Matched { exchange, message }).is_err() {
                                tracing::warn!(%peer, "device channel unavailable, dropping match");
                            }
                        },
                        None => tracing::debug!(%peer, "matched message for a finished task"),
                    }
                },

                Inbound::Unmatched => {
                    self.handle_unmatched(tasks, tracker, router, peer, message).await;
                },
            }
        }
    }

    async fn handle_unmatched(
        &self,
        tasks: &mut JoinSet<()>,
        tracker: &Arc<Mutex<TransactionTracker>>,
        router: &Router,
        peer: SocketAddr,
        message: Message,
    ) {
        // Acknowledgements and resets for nothing we track: drop.
        if matches!(message.kind, MessageKind::Acknowledgement | MessageKind::Reset) {
            return;
        }

        if self.is_announce(&message) {
            if message.kind == MessageKind::Confirmable {
                let mut ack =
                    Message::new(MessageKind::Acknowledgement, Code::CREATED, message.message_id);
                ack.token = message.token;
                send_datagram(&*self.transport, peer, &ack).await;
            }

            if !lock(router).contains_key(&peer) {
                let device_id = invariant_name(&peer);
                tracing::info!(%peer, device = %device_id, "device announced itself");
                self.spawn_device(
                    tasks,
                    tracker,
                    router,
                    device_id,
                    peer,
                    self.config.announce_resource.clone(),
                    CollectMode::Observe,
                    ANNOUNCE_POLL_INTERVAL,
                    ANNOUNCE_SETTLE_DELAY,
                );
            }
            return;
        }

        let sender = lock(router).get(&peer).cloned();
        match sender {
            Some(tx) => {
                if tx.try_send(Routed::Notification { message }).is_err() {
                    tracing::warn!(%peer, "device channel unavailable, dropping notification");
                }
            },
            None if message.kind == MessageKind::Confirmable => {
                // Unknown peer insisting on an answer: reject.
                send_datagram(&*self.transport, peer, &Message::reset(message.message_id)).await;
            },
            None => {},
        }
    }

    fn is_announce(&self, message: &Message) -> bool {
        message.code == Code::POST
            && self
                .config
                .announce_path
                .as_deref()
                .is_some_and(|path| message.uri_path() == path)
    }
}
