//! Per-connection reliable-delivery engine.
//!
//! A [`Connection`] owns the complete state for one peer relationship:
//!
//! ```text
//!  Application
//!      │ write(buf)                      read(buf) ▲
//!      ▼                                           │
//!  outbound store ──▶ send loop ──▶ DatagramSink   delivered chunks
//!      ▲                 │                         ▲
//!      │                 ▼                         │
//!  resend loop ◀── resend store ◀── Ack ── receive loop ◀── Inbound
//!                                                  │  └──▶ Ack ──▶ DatagramSink
//!                                            reorder store
//!  heartbeat loop ──▶ Heartbeat ──▶ DatagramSink
//! ```
//!
//! Four tasks run per open connection (send, resend, receive, heartbeat).
//! Only data is paced; `Ack`, `Heartbeat`, `Fin` and `FinAck` are written
//! directly by the loop that produces them.  The loops share only the three
//! [`SequencedStore`]s and the atomic [`StateCell`]; a `watch` channel
//! broadcasts the stop signal.  The
//! first loop to see a fatal condition records the error, moves the state to
//! [`ConnectionState::Failed`] and stops the rest.
//!
//! Connections are created either by an active open ([`Connection::dial`])
//! or by the listener on an inbound `Conn` ([`Connection::passive`] followed
//! by [`Connection::accept_handshake`]).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use crate::packet::{seq_lt, PacketError, Segment, SegmentKind, MAX_PAYLOAD};
use crate::socket::{ClientSocket, DatagramSink, Inbound};
use crate::state::{ConnectionState, Role, StateCell};
use crate::store::SequencedStore;
use crate::timer::{self, SendPacer, TimerConfig};

/// Errors surfaced by connection operations.
#[derive(Error, Debug, Clone)]
pub enum ConnError {
    /// A datagram failed to decode.  Never fatal to the connection.
    #[error("malformed segment: {0}")]
    Malformed(#[from] PacketError),
    /// No matching `ConnAck` within the attempt budget.
    #[error("no ConnAck after {0} handshake attempts")]
    HandshakeTimeout(u32),
    #[error("connection is not open (state: {0})")]
    NotOpen(ConnectionState),
    #[error("expected a Conn segment, got {0}")]
    UnexpectedSegment(SegmentKind),
    #[error("raw send wrote {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },
    #[error("socket I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("connection closed")]
    Closed,
    /// Returned by every operation after a fatal error; wraps the first one.
    #[error("connection failed: {0}")]
    Failed(Box<ConnError>),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("listener closed")]
    ListenerClosed,
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl ConnError {
    fn is_refused(&self) -> bool {
        matches!(self, ConnError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Hooks {
    established: Vec<Hook>,
    established_fired: bool,
    closed: Vec<Hook>,
    closed_fired: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the public handle and the four loop tasks.
struct Shared {
    role: Role,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: TimerConfig,
    state: StateCell,
    sink: Arc<dyn DatagramSink>,

    /// Our initial sequence number (carried by `Conn` or `ConnAck`).
    local_isn: u32,
    /// The peer's `Conn` sequence number; server side only.
    peer_conn_seq: AtomicU32,
    next_send_seq: Mutex<u32>,

    outbound: SequencedStore,
    resend: SequencedStore,
    reorder: SequencedStore,

    /// Data segments written but not yet acknowledged.
    pending: AtomicUsize,
    drained: Notify,

    fin_seq: Mutex<Option<u32>>,
    fin_done: Notify,

    last_send_at: Mutex<Instant>,
    last_recv_at: Mutex<Instant>,

    error: Mutex<Option<ConnError>>,
    stop_tx: watch::Sender<bool>,
    hooks: Mutex<Hooks>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    pacer: SendPacer,
}

impl Shared {
    fn current_seq(&self) -> u32 {
        *lock(&self.next_send_seq)
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Encode and write one segment; a short write is an error.
    async fn write_segment(&self, segment: &Segment) -> Result<(), ConnError> {
        let bytes = segment.encode()?;
        let written = self.sink.send_datagram(&bytes).await?;
        if written != bytes.len() {
            return Err(ConnError::IncompleteWrite {
                written,
                expected: bytes.len(),
            });
        }
        *lock(&self.last_send_at) = Instant::now();
        log::debug!(
            "[conn {}] → {} seq={} ack={} len={}",
            self.remote_addr,
            segment.kind,
            segment.seq,
            segment.ack,
            segment.payload.len()
        );
        Ok(())
    }

    fn on_ack(&self, seq: u32) {
        if self.resend.remove(seq).is_some() {
            log::debug!("[conn {}] ← ACK {seq}", self.remote_addr);
            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.drained.notify_waiters();
            }
        }
    }

    /// Fatal failure: poison, stop every loop, notify once.
    fn fail(&self, err: ConnError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        if let Some(prev) = self.state.finish(ConnectionState::Failed) {
            log::warn!(
                "[conn {}] failed while {prev}: {err}",
                self.remote_addr
            );
            self.stop();
            self.drained.notify_waiters();
            self.fin_done.notify_one();
            self.fire_closed();
        }
    }

    fn finish_closed(&self) {
        if let Some(prev) = self.state.finish(ConnectionState::Closed) {
            log::info!("[conn {}] closed (was {prev})", self.remote_addr);
            self.stop();
            self.drained.notify_waiters();
            self.fire_closed();
        }
    }

    fn poisoned(&self) -> Option<ConnError> {
        lock(&self.error).clone()
    }

    /// Error to hand a caller once no more data will ever arrive.
    fn terminal_error(&self) -> ConnError {
        match self.poisoned() {
            Some(err) => ConnError::Failed(Box::new(err)),
            None => ConnError::Closed,
        }
    }

    fn check_failed(&self) -> Result<(), ConnError> {
        match self.poisoned() {
            Some(err) => Err(ConnError::Failed(Box::new(err))),
            None => Ok(()),
        }
    }

    fn fire_established(&self) {
        let hooks = {
            let mut hooks = lock(&self.hooks);
            hooks.established_fired = true;
            std::mem::take(&mut hooks.established)
        };
        hooks.into_iter().for_each(|hook| hook());
    }

    fn fire_closed(&self) {
        let hooks = {
            let mut hooks = lock(&self.hooks);
            hooks.closed_fired = true;
            std::mem::take(&mut hooks.closed)
        };
        hooks.into_iter().for_each(|hook| hook());
    }
}

/// Everything the loops need that is created with the connection but only
/// handed over when the loops start.
struct LoopParts {
    pace_rx: watch::Receiver<Duration>,
    inbound: Inbound,
    delivered_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Application-side view of delivered data.
struct Reader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

/// Cheap, cloneable handle the listener uses to feed one connection.
#[derive(Debug, Clone)]
pub struct InboundHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InboundHandle {
    /// Hand a raw datagram to the connection's receive loop.
    ///
    /// A full queue drops the datagram (the peer will resend); a closed
    /// queue returns [`ConnError::Closed`].
    pub fn deliver(&self, datagram: Vec<u8>) -> Result<(), ConnError> {
        match self.tx.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("[conn] inbound queue full; dropping datagram");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnError::Closed),
        }
    }
}

/// A reliable, ordered connection to one peer over UDP.
///
/// Dropping the handle stops the loops without running the close protocol;
/// a connection that was not yet closed ends in `Closed` and its `on_closed`
/// hooks run.
pub struct Connection {
    shared: Arc<Shared>,
    reader: tokio::sync::Mutex<Reader>,
    read_deadline: Mutex<Option<Instant>>,
    parts: Mutex<Option<LoopParts>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("local_addr", &self.shared.local_addr)
            .field("remote_addr", &self.shared.remote_addr)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl Connection {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    fn build(
        role: Role,
        sink: Arc<dyn DatagramSink>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        config: TimerConfig,
        socket: Option<Arc<ClientSocket>>,
    ) -> Self {
        // Each connection seeds its own generator; nothing is shared.
        let local_isn: u32 = StdRng::from_entropy().gen();

        // Room for every datagram the handshake may set aside.
        let inbound_capacity = config
            .inbound_capacity
            .max(config.handshake_attempts as usize)
            .max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let (pacer, pace_rx) = SendPacer::new(config.send_interval);
        let now = Instant::now();

        let shared = Arc::new(Shared {
            role,
            local_addr,
            remote_addr,
            config,
            state: StateCell::new(ConnectionState::Connecting),
            sink,
            local_isn,
            peer_conn_seq: AtomicU32::new(0),
            next_send_seq: Mutex::new(local_isn.wrapping_add(1)),
            outbound: SequencedStore::new(),
            resend: SequencedStore::new(),
            reorder: SequencedStore::new(),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            fin_seq: Mutex::new(None),
            fin_done: Notify::new(),
            last_send_at: Mutex::new(now),
            last_recv_at: Mutex::new(now),
            error: Mutex::new(None),
            stop_tx,
            hooks: Mutex::new(Hooks::default()),
            inbound_tx,
            pacer,
        });

        Self {
            shared,
            reader: tokio::sync::Mutex::new(Reader {
                rx: delivered_rx,
                chunk: Vec::new(),
                offset: 0,
            }),
            read_deadline: Mutex::new(None),
            parts: Mutex::new(Some(LoopParts {
                pace_rx,
                inbound: Inbound::new(inbound_rx, socket),
                delivered_tx,
            })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Active open: bind `local`, send `Conn` to `remote`, wait for the
    /// matching `ConnAck`, then start the loops.
    ///
    /// Fails with [`ConnError::HandshakeTimeout`] when no matching `ConnAck`
    /// arrives within [`TimerConfig::handshake_attempts`] reads; no
    /// connection is returned in that case.
    pub async fn dial(
        local: SocketAddr,
        remote: SocketAddr,
        config: TimerConfig,
    ) -> Result<Self, ConnError> {
        let socket = Arc::new(ClientSocket::connect(local, remote).await?);
        let sink: Arc<dyn DatagramSink> = socket.clone();
        let conn = Self::build(
            Role::Client,
            sink,
            socket.local_addr,
            remote,
            config,
            Some(Arc::clone(&socket)),
        );

        let (peer_isn, early) = conn.client_handshake(&socket).await?;

        // Segments that overtook the ConnAck are replayed once open.
        for datagram in early {
            if conn.shared.inbound_tx.try_send(datagram).is_err() {
                log::warn!("[conn {remote}] inbound queue full; dropping early datagram");
            }
        }
        conn.shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open);
        log::info!(
            "[conn {remote}] open (client, isn={}, peer isn={peer_isn})",
            conn.shared.local_isn
        );
        conn.start(peer_isn.wrapping_add(1));
        conn.shared.fire_established();
        Ok(conn)
    }

    async fn client_handshake(
        &self,
        socket: &ClientSocket,
    ) -> Result<(u32, Vec<Vec<u8>>), ConnError> {
        let isn = self.shared.local_isn;
        let conn = Segment::conn(isn);
        let attempts = self.shared.config.handshake_attempts;
        let per_attempt = self.shared.config.handshake_attempt_timeout;

        self.write_handshake(&conn).await?;

        let mut early = Vec::new();
        for attempt in 1..=attempts {
            let datagram = match timeout(per_attempt, socket.recv_datagram()).await {
                Ok(Ok(datagram)) => datagram,
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    log::debug!("[conn {}] CONN refused (attempt {attempt})", socket.remote_addr);
                    tokio::time::sleep(per_attempt).await;
                    self.write_handshake(&conn).await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    log::debug!("[conn {}] no reply (attempt {attempt}); resending CONN", socket.remote_addr);
                    self.write_handshake(&conn).await?;
                    continue;
                }
            };

            match Segment::decode(&datagram) {
                Ok(seg) if seg.kind == SegmentKind::ConnAck && seg.ack == isn => {
                    return Ok((seg.seq, early));
                }
                Ok(seg) => {
                    log::debug!(
                        "[conn {}] buffering {} seq={} ack={} during handshake",
                        socket.remote_addr,
                        seg.kind,
                        seg.seq,
                        seg.ack
                    );
                    early.push(datagram);
                }
                Err(e) => {
                    log::warn!("[conn {}] dropping malformed datagram: {e}", socket.remote_addr);
                }
            }
        }

        log::warn!(
            "[conn {}] handshake failed after {attempts} attempts",
            socket.remote_addr
        );
        Err(ConnError::HandshakeTimeout(attempts))
    }

    /// Handshake writes tolerate the ICMP echo of an earlier attempt.
    async fn write_handshake(&self, segment: &Segment) -> Result<(), ConnError> {
        match self.shared.write_segment(segment).await {
            Err(e) if e.is_refused() => Ok(()),
            other => other,
        }
    }

    /// Create a server-side connection in the `Connecting` state.
    ///
    /// Register hooks, then call [`accept_handshake`](Self::accept_handshake)
    /// with the peer's `Conn` segment.
    pub fn passive(
        sink: Arc<dyn DatagramSink>,
        local: SocketAddr,
        remote: SocketAddr,
        config: TimerConfig,
    ) -> Self {
        Self::build(Role::Server, sink, local, remote, config, None)
    }

    /// Reply to the peer's `Conn` with a `ConnAck`, open, start the loops,
    /// and fire the `on_established` hook.
    pub async fn accept_handshake(&self, conn: &Segment) -> Result<(), ConnError> {
        if conn.kind != SegmentKind::Conn {
            return Err(ConnError::UnexpectedSegment(conn.kind));
        }
        let state = self.shared.state.get();
        if state != ConnectionState::Connecting {
            return Err(ConnError::NotOpen(state));
        }

        self.shared.peer_conn_seq.store(conn.seq, Ordering::Release);
        let reply = Segment::conn_ack(self.shared.local_isn, conn.seq);
        if let Err(e) = self.shared.write_segment(&reply).await {
            self.shared.fail(e.clone());
            return Err(e);
        }

        if !self
            .shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Open)
        {
            return Err(ConnError::NotOpen(self.shared.state.get()));
        }
        log::info!(
            "[conn {}] open (server, isn={}, peer isn={})",
            self.shared.remote_addr,
            self.shared.local_isn,
            conn.seq
        );
        self.start(conn.seq.wrapping_add(1));
        self.shared.fire_established();
        Ok(())
    }

    /// Spawn the four loops.  `expected` is the first data sequence number
    /// the peer will send.
    fn start(&self, expected: u32) {
        let Some(parts) = lock(&self.parts).take() else {
            return;
        };
        let stop_rx = self.shared.stop_tx.subscribe();
        let handles = vec![
            tokio::spawn(send_loop(
                Arc::clone(&self.shared),
                parts.pace_rx,
                stop_rx.clone(),
            )),
            tokio::spawn(resend_loop(Arc::clone(&self.shared), stop_rx.clone())),
            tokio::spawn(receive_loop(
                Arc::clone(&self.shared),
                parts.inbound,
                parts.delivered_tx,
                expected,
                stop_rx.clone(),
            )),
            tokio::spawn(heartbeat_loop(Arc::clone(&self.shared), stop_rx)),
        ];
        lock(&self.tasks).extend(handles);
    }

    // -----------------------------------------------------------------------
    // Collaborator interface
    // -----------------------------------------------------------------------

    /// Hand a raw datagram to this connection's receive path.
    pub fn deliver_inbound(&self, datagram: Vec<u8>) -> Result<(), ConnError> {
        self.inbound_handle().deliver(datagram)
    }

    /// A detached handle for [`deliver_inbound`](Self::deliver_inbound).
    pub fn inbound_handle(&self) -> InboundHandle {
        InboundHandle {
            tx: self.shared.inbound_tx.clone(),
        }
    }

    /// Run `hook` when the connection opens (immediately if it already has).
    /// Hooks accumulate; each runs exactly once.
    pub fn on_established<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = lock(&self.shared.hooks);
        if hooks.established_fired {
            drop(hooks);
            hook();
        } else {
            hooks.established.push(Box::new(hook));
        }
    }

    /// Run `hook` once the connection reaches `Closed` or `Failed`
    /// (immediately if it already has).
    pub fn on_closed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = lock(&self.shared.hooks);
        if hooks.closed_fired {
            drop(hooks);
            hook();
        } else {
            hooks.closed.push(Box::new(hook));
        }
    }

    // -----------------------------------------------------------------------
    // Application interface
    // -----------------------------------------------------------------------

    /// Split `buf` into segments of at most [`MAX_PAYLOAD`] bytes and queue
    /// them for delivery.
    ///
    /// Returns once everything is queued; delivery happens in the background.
    pub fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        self.shared.check_failed()?;
        match self.shared.state.get() {
            ConnectionState::Open => {}
            ConnectionState::Closed => return Err(ConnError::Closed),
            other => return Err(ConnError::NotOpen(other)),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Held across the loop so one write's chunks stay contiguous.
        let mut seq = lock(&self.shared.next_send_seq);
        for chunk in buf.chunks(MAX_PAYLOAD) {
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
            self.shared.outbound.insert(Segment::data(*seq, chunk.to_vec()));
            *seq = seq.wrapping_add(1);
        }
        Ok(buf.len())
    }

    /// Copy the next in-order bytes into `buf`, waiting for data if none is
    /// buffered.  A chunk larger than `buf` is returned over several calls.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        self.shared.check_failed()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        if reader.offset >= reader.chunk.len() {
            let chunk = self.next_chunk(&mut reader).await?;
            reader.chunk = chunk;
            reader.offset = 0;
        }
        let start = reader.offset;
        let n = buf.len().min(reader.chunk.len() - start);
        buf[..n].copy_from_slice(&reader.chunk[start..start + n]);
        reader.offset += n;
        Ok(n)
    }

    /// Receive the next delivered chunk (or the unread rest of one).
    pub async fn recv(&self) -> Result<Vec<u8>, ConnError> {
        self.shared.check_failed()?;
        let mut reader = self.reader.lock().await;
        if reader.offset < reader.chunk.len() {
            let offset = reader.offset;
            let rest = reader.chunk.split_off(offset);
            reader.chunk.clear();
            reader.offset = 0;
            return Ok(rest);
        }
        self.next_chunk(&mut reader).await
    }

    async fn next_chunk(&self, reader: &mut Reader) -> Result<Vec<u8>, ConnError> {
        let deadline = *lock(&self.read_deadline);
        let next = match deadline {
            Some(at) => timeout_at(at, reader.rx.recv())
                .await
                .map_err(|_| ConnError::DeadlineExceeded)?,
            None => reader.rx.recv().await,
        };
        next.ok_or_else(|| self.shared.terminal_error())
    }

    /// Wait until every written data segment has been acknowledged, or
    /// `limit` elapses ([`ConnError::DeadlineExceeded`]).
    pub async fn flush(&self, limit: Duration) -> Result<(), ConnError> {
        let deadline = Instant::now() + limit;
        loop {
            self.shared.check_failed()?;
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            if self.shared.state.get().is_terminal() {
                return Err(self.shared.terminal_error());
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(ConnError::DeadlineExceeded);
            }
        }
    }

    /// Graceful close: flush (bounded by [`TimerConfig::linger`]), send
    /// `Fin`, wait (bounded) for `FinAck`, stop the loops.
    ///
    /// If the `Fin` cannot be written the I/O error is returned and the
    /// connection stays open, so the caller may retry.
    pub async fn close(&self) -> Result<(), ConnError> {
        let state = self.shared.state.get();
        if state != ConnectionState::Open {
            return Err(ConnError::NotOpen(state));
        }

        match self.flush(self.shared.config.linger).await {
            Ok(()) => {}
            Err(ConnError::DeadlineExceeded) => log::warn!(
                "[conn {}] closing with {} unacknowledged segment(s)",
                self.shared.remote_addr,
                self.shared.pending.load(Ordering::Acquire)
            ),
            Err(ConnError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }

        if !self
            .shared
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            return match self.shared.state.get() {
                ConnectionState::Closed => Ok(()),
                other => Err(ConnError::NotOpen(other)),
            };
        }

        let fin_seq = self.shared.current_seq();
        *lock(&self.shared.fin_seq) = Some(fin_seq);
        if let Err(e) = self.shared.write_segment(&Segment::fin(fin_seq)).await {
            *lock(&self.shared.fin_seq) = None;
            self.shared
                .state
                .transition(ConnectionState::Closing, ConnectionState::Open);
            return Err(e);
        }

        let fin_ack_timeout = self.shared.config.fin_ack_timeout;
        if timeout(fin_ack_timeout, self.shared.fin_done.notified())
            .await
            .is_err()
        {
            log::warn!(
                "[conn {}] no FIN-ACK within {fin_ack_timeout:?}; closing anyway",
                self.shared.remote_addr
            );
        }

        self.shared.finish_closed();
        self.join_loops().await;
        self.shared.check_failed()
    }

    async fn join_loops(&self) {
        let handles: Vec<_> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Change the pacing interval of the send loop.  Queued segments stay queued.
    pub fn set_send_interval(&self, interval: Duration) {
        self.shared.pacer.set(interval);
    }

    pub fn send_interval(&self) -> Duration {
        self.shared.pacer.current()
    }

    /// Reads waiting past `deadline` fail with [`ConnError::DeadlineExceeded`].
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.read_deadline) = deadline;
    }

    /// Accepted for interface parity; `write` never blocks.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// Data segments written but not yet acknowledged.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn last_send_at(&self) -> Instant {
        *lock(&self.shared.last_send_at)
    }

    pub fn last_recv_at(&self) -> Instant {
        *lock(&self.shared.last_recv_at)
    }

    /// The first fatal error, if any.
    pub fn error(&self) -> Option<ConnError> {
        self.shared.poisoned()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.finish_closed();
        self.shared.stop();
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    // The sender lives in `Shared`, which outlives every loop.
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// One data segment per pacing tick.
async fn send_loop(
    shared: Arc<Shared>,
    mut pace_rx: watch::Receiver<Duration>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut tick = timer::ticker(*pace_rx.borrow_and_update());
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            Ok(()) = pace_rx.changed() => {
                let period = *pace_rx.borrow_and_update();
                log::debug!("[conn {}] send interval → {period:?}", shared.remote_addr);
                tick = timer::ticker(period);
                continue;
            }
            _ = tick.tick() => {}
        }

        let segment = tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            segment = shared.outbound.consume_oldest() => segment,
        };

        if let Err(e) = shared.write_segment(&segment).await {
            shared.fail(e);
            break;
        }
        shared.resend.insert(segment);
    }
    log::debug!("[conn {}] send loop stopped", shared.remote_addr);
}

/// Move aged, unacknowledged data back onto the outbound queue.
async fn resend_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let threshold = shared.config.resend_threshold;
    let mut tick = timer::ticker(shared.config.resend_scan_interval);
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = tick.tick() => {}
        }

        let expired = shared.resend.consume_older_than(threshold);
        if expired.is_empty() {
            continue;
        }
        log::debug!(
            "[conn {}] resending {} segment(s) older than {threshold:?}",
            shared.remote_addr,
            expired.len()
        );
        // Re-enters the resend store only after the send loop writes it.
        for segment in expired {
            shared.outbound.insert(segment);
        }
    }
    log::debug!("[conn {}] resend loop stopped", shared.remote_addr);
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: Inbound,
    delivered: mpsc::UnboundedSender<Vec<u8>>,
    mut expected: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            next = inbound.next() => next,
        };
        let datagram = match next {
            Ok(Some(datagram)) => datagram,
            Ok(None) => break,
            Err(e) => {
                shared.fail(e.into());
                break;
            }
        };
        let segment = match Segment::decode(&datagram) {
            Ok(segment) => segment,
            Err(e) => {
                log::warn!("[conn {}] dropping malformed datagram: {e}", shared.remote_addr);
                continue;
            }
        };
        *lock(&shared.last_recv_at) = Instant::now();

        match segment.kind {
            SegmentKind::Normal => {
                let seq = segment.seq;
                if seq == expected {
                    deliver(&delivered, segment.payload);
                    expected = expected.wrapping_add(1);
                    while let Some(next) = shared.reorder.remove(expected) {
                        deliver(&delivered, next.payload);
                        expected = expected.wrapping_add(1);
                    }
                } else if seq_lt(expected, seq) {
                    if seq.wrapping_sub(expected) > shared.config.reorder_window {
                        // Unacked, so the peer resends it once the gap closes.
                        log::warn!(
                            "[conn {}] ← DATA seq={seq} beyond reorder window of {expected}; dropping",
                            shared.remote_addr
                        );
                        continue;
                    }
                    log::debug!(
                        "[conn {}] ← DATA seq={seq} ahead of {expected}; buffering",
                        shared.remote_addr
                    );
                    shared.reorder.insert(segment);
                } else {
                    log::debug!("[conn {}] ← duplicate DATA seq={seq}", shared.remote_addr);
                }
                if let Err(e) = shared.write_segment(&Segment::ack(shared.current_seq(), seq)).await {
                    shared.fail(e);
                    break;
                }
            }
            SegmentKind::Ack => shared.on_ack(segment.ack),
            SegmentKind::Heartbeat => {
                log::debug!("[conn {}] ← HEARTBEAT", shared.remote_addr);
            }
            SegmentKind::Fin => {
                log::info!("[conn {}] ← FIN; closing", shared.remote_addr);
                let reply = Segment::fin_ack(shared.current_seq(), segment.seq);
                if let Err(e) = shared.write_segment(&reply).await {
                    shared.fail(e);
                    break;
                }
                shared
                    .state
                    .transition(ConnectionState::Open, ConnectionState::Closing);
                // Also completes a close of our own that is waiting.
                shared.fin_done.notify_one();
                shared.finish_closed();
                break;
            }
            SegmentKind::FinAck => {
                let awaited = *lock(&shared.fin_seq);
                if awaited == Some(segment.ack) {
                    log::debug!("[conn {}] ← FIN-ACK", shared.remote_addr);
                    shared.fin_done.notify_one();
                } else {
                    log::debug!(
                        "[conn {}] ignoring FIN-ACK ack={}",
                        shared.remote_addr,
                        segment.ack
                    );
                }
            }
            SegmentKind::Conn => {
                let original = shared.peer_conn_seq.load(Ordering::Acquire);
                if shared.role == Role::Server && segment.seq == original {
                    // Our ConnAck was lost; answer again, state unchanged.
                    let reply = Segment::conn_ack(shared.local_isn, original);
                    if let Err(e) = shared.write_segment(&reply).await {
                        shared.fail(e);
                        break;
                    }
                } else {
                    log::debug!("[conn {}] ignoring stale CONN", shared.remote_addr);
                }
            }
            SegmentKind::ConnAck => {
                log::debug!("[conn {}] ignoring stale CONN-ACK", shared.remote_addr);
            }
        }
    }
    log::debug!("[conn {}] receive loop stopped", shared.remote_addr);
}

fn deliver(delivered: &mpsc::UnboundedSender<Vec<u8>>, payload: Vec<u8>) {
    if !payload.is_empty() {
        let _ = delivered.send(payload);
    }
}

/// Send a heartbeat after a full cycle with nothing sent.
async fn heartbeat_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let cycle = shared.config.heartbeat_cycle.max(Duration::from_millis(1));
    let mut tick = tokio::time::interval_at(Instant::now() + cycle, cycle);
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = tick.tick() => {}
        }
        if shared.state.get() != ConnectionState::Open {
            continue;
        }
        let idle = lock(&shared.last_send_at).elapsed();
        if idle >= cycle {
            log::debug!("[conn {}] idle for {idle:?}; heartbeat", shared.remote_addr);
            if let Err(e) = shared.write_segment(&Segment::heartbeat(shared.current_seq())).await {
                shared.fail(e);
                break;
            }
        }
    }
    log::debug!("[conn {}] heartbeat loop stopped", shared.remote_addr);
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
