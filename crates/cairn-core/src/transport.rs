//! Datagram transport abstraction.
//!
//! The collector engine is transport-agnostic: production binds a tokio
//! UDP socket, the simulation harness binds a turmoil socket. Both sides
//! of the socket are shared — datagram sends interleave freely from any
//! task, while a single dispatch task owns the receive loop.

use std::{io, net::SocketAddr};

use async_trait::async_trait;

/// A shared, connectionless datagram socket.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `peer`.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error. Datagram loss is not an
    /// error — the reliability layer above handles it.
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()>;

    /// Receive one datagram, returning its length and source address.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// The local address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
