//! Transaction tracker: exchange identifiers and duplicate suppression.
//!
//! Owns the state that was global in callback-style CoAP stacks, accessed
//! only through its operations:
//!
//! - dedup map from (peer, message-id) to first-seen time, pruned after
//!   the exchange lifetime
//! - open exchanges addressable by token (responses) and by message-id
//!   (acknowledgements and resets)
//! - reserved observation tokens, so a live observation's token is never
//!   reallocated to a new exchange
//!
//! All mutation happens under the caller's lock; no method awaits.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::SocketAddr,
    time::Duration,
};

use cairn_proto::{Message, MessageKind, Token};
use tokio::time::Instant;

use crate::env::Environment;

/// Length of the random tokens allocated for outbound requests.
const TOKEN_LEN: usize = 4;

/// Attempts at drawing a collision-free random token before giving up.
const TOKEN_DRAWS: usize = 32;

/// Opaque handle for one open exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Identifiers allocated for an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenExchange {
    /// Tracker handle for closing the exchange.
    pub id: ExchangeId,
    /// Peer the request is addressed to.
    pub peer: SocketAddr,
    /// Allocated message-id, unique among in-flight exchanges to `peer`.
    pub message_id: u16,
    /// Allocated token, unique among open exchanges and reserved
    /// observation tokens for `peer`.
    pub token: Token,
}

/// Classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Repeated delivery of a (peer, message-id) already seen within the
    /// dedup window. Confirmable duplicates should be re-acknowledged.
    Duplicate,
    /// Correlates to an open exchange.
    Matched(ExchangeId),
    /// No open exchange matches: either a server-initiated notification
    /// for an observation, or noise to be dropped.
    Unmatched,
}

/// Errors from tracker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// Every identifier in the space is in use for this peer. Transient:
    /// the caller retries registration after open exchanges close.
    #[error("no unused exchange identifier for peer {0}")]
    ExhaustedIdentifiers(SocketAddr),
}

/// Exchange and duplicate bookkeeping shared by all device tasks.
pub struct TransactionTracker {
    exchange_lifetime: Duration,
    dedup: HashMap<(SocketAddr, u16), Instant>,
    open: HashMap<ExchangeId, OpenExchange>,
    by_token: HashMap<(SocketAddr, Token), ExchangeId>,
    by_mid: HashMap<(SocketAddr, u16), ExchangeId>,
    reserved: HashSet<(SocketAddr, Token)>,
    next_id: u64,
    next_mid: u16,
}

impl TransactionTracker {
    /// Create a tracker with the given dedup window. The outbound
    /// message-id counter is seeded randomly so restarts do not collide
    /// with ids a peer may still remember.
    pub fn new<E: Environment>(env: &E, exchange_lifetime: Duration) -> Self {
        Self {
            exchange_lifetime,
            dedup: HashMap::new(),
            open: HashMap::new(),
            by_token: HashMap::new(),
            by_mid: HashMap::new(),
            reserved: HashSet::new(),
            next_id: 0,
            next_mid: env.random_u32() as u16,
        }
    }

    /// Allocate identifiers for a new request to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::ExhaustedIdentifiers`] when no unused
    /// message-id or token exists for the peer — practically unreachable
    /// given the 16-bit id space, but checked.
    pub fn register<E: Environment>(
        &mut self,
        env: &E,
        peer: SocketAddr,
    ) -> Result<OpenExchange, TrackerError> {
        let message_id = self.allocate_mid(peer)?;
        let token = self.allocate_token(env, peer)?;

        let id = ExchangeId(self.next_id);
        self.next_id += 1;

        let exchange = OpenExchange { id, peer, message_id, token };
        self.open.insert(id, exchange);
        self.by_token.insert((peer, token), id);
        self.by_mid.insert((peer, message_id), id);

        tracing::trace!(%id, %peer, message_id, %token, "registered exchange");
        Ok(exchange)
    }

    fn allocate_mid(&mut self, peer: SocketAddr) -> Result<u16, TrackerError> {
        for _ in 0..(1u32 << 16) {
            let candidate = self.next_mid;
            self.next_mid = self.next_mid.wrapping_add(1);
            if !self.by_mid.contains_key(&(peer, candidate)) {
                return Ok(candidate);
            }
        }
        Err(TrackerError::ExhaustedIdentifiers(peer))
    }

    fn allocate_token<E: Environment>(
        &mut self,
        env: &E,
        peer: SocketAddr,
    ) -> Result<Token, TrackerError> {
        for _ in 0..TOKEN_DRAWS {
            let mut bytes = [0u8; TOKEN_LEN];
            env.random_bytes(&mut bytes);
            let token = Token::new(&bytes).unwrap_or(Token::EMPTY);

            if !self.by_token.contains_key(&(peer, token))
                && !self.reserved.contains(&(peer, token))
            {
                return Ok(token);
            }
        }
        Err(TrackerError::ExhaustedIdentifiers(peer))
    }

    /// Classify an inbound message from `peer`.
    ///
    /// Confirmable and non-confirmable messages pass the dedup check
    /// first; acknowledgements and resets match by message-id, everything
    /// else by token.
    pub fn on_inbound(&mut self, peer: SocketAddr, msg: &Message, now: Instant) -> Inbound {
        match msg.kind {
            MessageKind::Acknowledgement | MessageKind::Reset => self
                .by_mid
                .get(&(peer, msg.message_id))
                .copied()
                .map_or(Inbound::Unmatched, Inbound::Matched),

            MessageKind::Confirmable | MessageKind::NonConfirmable => {
                if let Some(first_seen) = self.dedup.get(&(peer, msg.message_id))
                    && now.duration_since(*first_seen) < self.exchange_lifetime
                {
                    return Inbound::Duplicate;
                }
                self.dedup.insert((peer, msg.message_id), now);

                self.by_token
                    .get(&(peer, msg.token))
                    .copied()
                    .map_or(Inbound::Unmatched, Inbound::Matched)
            },
        }
    }

    /// Close an exchange, releasing its identifiers. Idempotent: closing
    /// an unknown or already-closed id is a no-op.
    pub fn close(&mut self, id: ExchangeId) {
        if let Some(exchange) = self.open.remove(&id) {
            self.by_token.remove(&(exchange.peer, exchange.token));
            self.by_mid.remove(&(exchange.peer, exchange.message_id));
            tracing::trace!(%id, "closed exchange");
        }
    }

    /// Pin an observation token so later registrations cannot collide
    /// with it after its originating exchange closes.
    pub fn reserve_token(&mut self, peer: SocketAddr, token: Token) {
        self.reserved.insert((peer, token));
    }

    /// Release a previously reserved observation token.
    pub fn release_token(&mut self, peer: SocketAddr, token: Token) {
        self.reserved.remove(&(peer, token));
    }

    /// Drop all exchange state and reservations for a peer. Called when a
    /// device task is cancelled so identifiers do not leak.
    pub fn release_peer(&mut self, peer: SocketAddr) {
        self.open.retain(|_, e| e.peer != peer);
        self.by_token.retain(|(p, _), _| *p != peer);
        self.by_mid.retain(|(p, _), _| *p != peer);
        self.reserved.retain(|(p, _)| *p != peer);
    }

    /// Expire dedup entries older than the exchange lifetime.
    pub fn prune(&mut self, now: Instant) {
        let lifetime = self.exchange_lifetime;
        self.dedup.retain(|_, first_seen| now.duration_since(*first_seen) < lifetime);
    }

    /// Number of currently open exchanges.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
