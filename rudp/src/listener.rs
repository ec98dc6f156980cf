//! Server-side demultiplexer.
//!
//! One UDP socket serves every peer.  The listen loop routes each datagram by
//! source address:
//! - a known peer's datagram goes to that connection's inbound queue,
//! - an unknown peer's `Conn` creates a passive [`Connection`], answers the
//!   handshake and pushes it onto the accept queue,
//! - anything else from an unknown peer is dropped.
//!
//! Connections remove themselves from the peer table through their
//! `on_closed` hook.
//!
//! Closing the listener stops new `Conn`s and ends the accept queue, but the
//! loop keeps routing for established peers and exits once the last one has
//! been evicted.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};

use crate::connection::{ConnError, Connection, InboundHandle};
use crate::packet::{Segment, SegmentKind, MAX_DATAGRAM};
use crate::socket::PeerSink;
use crate::timer::TimerConfig;

type PeerTable = Arc<DashMap<SocketAddr, InboundHandle>>;

pub struct Listener {
    local_addr: SocketAddr,
    peers: PeerTable,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    /// Socket error that ended the listen loop, if any.
    error: Arc<Mutex<Option<ConnError>>>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl Listener {
    /// Bind `addr` and start routing datagrams.
    pub async fn bind(addr: SocketAddr, config: TimerConfig) -> Result<Self, ConnError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let peers: PeerTable = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let error = Arc::new(Mutex::new(None));

        tokio::spawn(listen_loop(ListenLoop {
            socket,
            local_addr,
            config,
            peers: Arc::clone(&peers),
            accept_tx: Some(accept_tx),
            evicted: Arc::new(Notify::new()),
            error: Arc::clone(&error),
            stop_rx,
        }));
        log::info!("[listener] bound on {local_addr}");

        Ok(Self {
            local_addr,
            peers,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            error,
            stop_tx,
        })
    }

    /// Wait for the next established connection.
    ///
    /// Once the listen loop has ended and the queue is drained, returns the
    /// socket error that ended it, or [`ConnError::ListenerClosed`].
    pub async fn accept(&self) -> Result<Connection, ConnError> {
        let next = self.accept_rx.lock().await.recv().await;
        next.ok_or_else(|| {
            self.error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or(ConnError::ListenerClosed)
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of peers currently routed.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Stop accepting.  Connections already accepted keep working until
    /// their owners close or drop them.
    pub fn close(&self) {
        if !self.stop_tx.send_replace(true) {
            log::info!("[listener] {} closed", self.local_addr);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

struct ListenLoop {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: TimerConfig,
    peers: PeerTable,
    /// `None` once the listener is closed.
    accept_tx: Option<mpsc::Sender<Connection>>,
    /// Signalled by every eviction hook.
    evicted: Arc<Notify>,
    error: Arc<Mutex<Option<ConnError>>>,
    stop_rx: watch::Receiver<bool>,
}

async fn listen_loop(mut ctx: ListenLoop) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut closing = false;
    loop {
        if closing && ctx.peers.is_empty() {
            break;
        }
        let received = tokio::select! {
            biased;
            _ = ctx.stop_rx.wait_for(|stop| *stop), if !closing => {
                closing = true;
                // Ends the accept queue once it is drained.
                ctx.accept_tx = None;
                log::debug!(
                    "[listener] closing; still routing {} peer(s)",
                    ctx.peers.len()
                );
                continue;
            }
            _ = ctx.evicted.notified(), if closing => continue,
            received = ctx.socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                log::warn!("[listener] socket error: {e}");
                *ctx.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.into());
                break;
            }
        };
        let datagram = buf[..n].to_vec();

        let known = ctx.peers.get(&peer).map(|entry| entry.value().clone());
        if let Some(handle) = known {
            if handle.deliver(datagram).is_err() {
                log::debug!("[listener] {peer} is gone; evicting");
                ctx.peers.remove(&peer);
            }
            continue;
        }

        match Segment::decode(&datagram) {
            Ok(segment) if segment.kind == SegmentKind::Conn => match &ctx.accept_tx {
                Some(accept_tx) => handle_conn(&ctx, accept_tx, peer, segment).await,
                None => log::debug!("[listener] closed; ignoring CONN from {peer}"),
            },
            Ok(segment) => {
                log::debug!("[listener] dropping {} from unknown peer {peer}", segment.kind);
            }
            Err(e) => {
                log::warn!("[listener] dropping malformed datagram from {peer}: {e}");
            }
        }
    }
    log::debug!("[listener] listen loop on {} stopped", ctx.local_addr);
}

async fn handle_conn(
    ctx: &ListenLoop,
    accept_tx: &mpsc::Sender<Connection>,
    peer: SocketAddr,
    conn_segment: Segment,
) {
    // Reserve the accept slot first so a full backlog never leaves a
    // half-open peer behind.
    let permit = match accept_tx.try_reserve() {
        Ok(permit) => permit,
        Err(_) => {
            log::warn!("[listener] accept backlog full; ignoring CONN from {peer}");
            return;
        }
    };

    let sink = Arc::new(PeerSink::new(Arc::clone(&ctx.socket), peer));
    let conn = Connection::passive(sink, ctx.local_addr, peer, ctx.config.clone());

    let peers = Arc::clone(&ctx.peers);
    let evicted = Arc::clone(&ctx.evicted);
    conn.on_closed(move || {
        peers.remove(&peer);
        evicted.notify_one();
        log::debug!("[listener] evicted {peer}");
    });
    conn.on_established(move || log::info!("[listener] accepted {peer}"));

    ctx.peers.insert(peer, conn.inbound_handle());
    if let Err(e) = conn.accept_handshake(&conn_segment).await {
        log::warn!("[listener] handshake with {peer} failed: {e}");
        ctx.peers.remove(&peer);
        return;
    }
    permit.send(conn);
}
