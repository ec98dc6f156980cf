//! Datagram I/O seam between the connection engine and the network.
//!
//! The engine never owns a socket type directly.  It writes through a
//! [`DatagramSink`] and reads through an [`Inbound`] source:
//! - a **client** connection owns a connected [`UdpSocket`] ([`ClientSocket`])
//!   and reads from it directly,
//! - a **server** connection shares the listener's socket ([`PeerSink`]) and
//!   receives datagrams the listener hands it through a channel.
//!
//! All protocol logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::packet::MAX_DATAGRAM;

/// A writable raw-datagram sink.
///
/// Implementations return the number of bytes the OS accepted; the caller
/// treats a short count as a failed write.
#[async_trait]
pub trait DatagramSink: Send + Sync + std::fmt::Debug {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;
}

/// A UDP socket `connect`ed to exactly one peer.
#[derive(Debug)]
pub struct ClientSocket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    inner: UdpSocket,
}

impl ClientSocket {
    /// Bind to `local_addr` and connect to `remote_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn connect(local_addr: SocketAddr, remote_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        inner.connect(remote_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            remote_addr,
            inner,
        })
    }

    /// Receive the next datagram from the connected peer.
    pub async fn recv_datagram(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.inner.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait]
impl DatagramSink for ClientSocket {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.inner.send(datagram).await
    }
}

/// Server-side sink: the listener's shared socket plus one peer address.
#[derive(Debug, Clone)]
pub struct PeerSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl PeerSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl DatagramSink for PeerSink {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send_to(datagram, self.peer).await
    }
}

/// Where a connection's receive loop gets raw datagrams from.
///
/// The channel is always present so the listener (or a test) can hand
/// datagrams in; a client additionally reads its own socket.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    socket: Option<Arc<ClientSocket>>,
}

impl Inbound {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, socket: Option<Arc<ClientSocket>>) -> Self {
        Self { rx, socket }
    }

    /// Next raw datagram.
    ///
    /// `Ok(None)` means the channel closed and there is no socket to fall
    /// back on; `Err` is a socket failure.
    pub async fn next(&mut self) -> io::Result<Option<Vec<u8>>> {
        match &self.socket {
            Some(socket) => tokio::select! {
                biased;
                Some(datagram) = self.rx.recv() => Ok(Some(datagram)),
                result = socket.recv_datagram() => result.map(Some),
            },
            None => Ok(self.rx.recv().await),
        }
    }
}
