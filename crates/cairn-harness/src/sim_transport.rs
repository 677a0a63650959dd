//! Turmoil implementation of the datagram transport.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use cairn_core::Transport;
use turmoil::net::UdpSocket;

/// Shared turmoil UDP socket behind the collector's transport trait.
///
/// The same collector code that binds a tokio socket in production binds
/// this inside a simulated host.
pub struct SimTransport {
    socket: UdpSocket,
}

impl SimTransport {
    /// Bind a simulated socket on this host.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(buf, peer).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
