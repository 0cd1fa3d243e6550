//! One TCP link to one peer: connect/accept lifecycle, framed reads, queued writes, frame counters.
//!
//! Each connection runs a lifecycle task on the host's tokio runtime. The task establishes the
//! socket (client: connect with retry; server: accept, and accept again after the peer left),
//! then runs the read loop inline while a writer task drains a bounded queue of complete
//! messages. A peer that stops reading fills the queue and further sends fail with
//! [`SendError::Full`] instead of buffering without limit. [`Connection::close`] flips a watch channel that every await point races against,
//! so a pending read or accept returns immediately.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::protocol::{ConnectionKind, MessageKind, Role, HEADER_SIZE};
use crate::wire::{self, HeaderError};

/// Initial receive buffer size; grows on demand.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Delay between client connect attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Messages queued for the writer before sends fail with [`SendError::Full`].
pub const SEND_QUEUE_DEPTH: usize = 8;

/// How long a graceful close waits for the connection's tasks.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing connection lets the writer flush what is queued.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Frame counter value meaning "nothing received yet".
const NO_FRAME: i64 = -1;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Unique within the owning cluster network.
    pub id: usize,
    /// Server address to connect to (client), or local address to bind (server).
    pub address: String,
    pub port: u16,
    pub role: Role,
    pub kind: ConnectionKind,
    /// Initial receive buffer capacity in bytes.
    pub buffer_size: usize,
}

/// Callbacks from a connection's tasks. They run on runtime worker threads and must not block.
pub trait ConnectionHandler: Send + Sync {
    /// Payload of a `Data` message (already inflated if it was compressed).
    /// `number` is the frame number on sync connections (client side only) and the package id
    /// on data transfer.
    fn on_data(&self, _conn: &Connection, _number: u32, _payload: &[u8]) {}

    /// A received frame number was recorded (sync connections).
    fn on_frame(&self, _conn: &Connection, _frame: u32) {}

    /// The peer confirmed receipt of a data-transfer package.
    fn on_acknowledged(&self, _conn: &Connection, _package_id: u32) {}

    /// The connection came up or went down; see [`Connection::is_connected`].
    fn on_status(&self, _conn: &Connection) {}

    /// The server announced that every node of the cluster is connected.
    fn on_cluster_connected(&self, _conn: &Connection) {}
}

/// Handler that ignores everything.
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

/// Error queueing a message for sending.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection {0} is not connected")]
    NotConnected(usize),
    #[error("connection {0} writer has stopped")]
    Closed(usize),
    #[error("connection {0} send queue is full")]
    Full(usize),
}

/// Why a read loop ended.
#[derive(Debug, PartialEq, Eq)]
enum ReadEnd {
    /// Socket EOF.
    PeerClosed,
    /// The peer sent `Disconnect`.
    Disconnected,
    /// Local shutdown was requested.
    Shutdown,
}

/// One peer link. Cheap to query from any thread; counters and flags are atomics.
pub struct Connection {
    id: usize,
    address: String,
    port: u16,
    role: Role,
    kind: ConnectionKind,
    buffer_size: usize,
    handler: Arc<dyn ConnectionHandler>,

    connected: AtomicBool,
    active: AtomicBool,
    updated: AtomicBool,
    send_current: AtomicU32,
    send_previous: AtomicU32,
    recv_current: AtomicU32,
    /// Previous received frame, or [`NO_FRAME`] before the first receive.
    recv_previous: AtomicI64,
    /// f64 bits of the last measured round trip, in seconds.
    loop_time: AtomicU64,
    send_stamp: Mutex<Option<Instant>>,

    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    finished: (Mutex<bool>, Condvar),
}

impl Connection {
    fn new(params: ConnectionParams, handler: Arc<dyn ConnectionHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: params.id,
            address: params.address,
            port: params.port,
            role: params.role,
            kind: params.kind,
            buffer_size: params.buffer_size,
            handler,
            connected: AtomicBool::new(false),
            active: AtomicBool::new(true),
            updated: AtomicBool::new(false),
            send_current: AtomicU32::new(0),
            send_previous: AtomicU32::new(0),
            recv_current: AtomicU32::new(0),
            recv_previous: AtomicI64::new(NO_FRAME),
            loop_time: AtomicU64::new(0f64.to_bits()),
            send_stamp: Mutex::new(None),
            outbound: Mutex::new(None),
            shutdown,
            task: Mutex::new(None),
            finished: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Create the connection and start its lifecycle task on `runtime`.
    /// Connectivity problems never surface here; watch [`Connection::is_connected`].
    pub fn open(
        runtime: &Handle,
        params: ConnectionParams,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self::new(params, handler));
        let shutdown = conn.shutdown.subscribe();
        let task = runtime.spawn(conn.clone().run(shutdown));
        *lock(&conn.task) = Some(task);
        conn
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// False once shutdown was requested or a client lost its server for good.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn send_frame_current(&self) -> u32 {
        self.send_current.load(Ordering::Acquire)
    }

    pub fn send_frame_previous(&self) -> u32 {
        self.send_previous.load(Ordering::Acquire)
    }

    pub fn recv_frame_current(&self) -> u32 {
        self.recv_current.load(Ordering::Acquire)
    }

    /// `None` until a second frame number has been received.
    pub fn recv_frame_previous(&self) -> Option<u32> {
        u32::try_from(self.recv_previous.load(Ordering::Acquire)).ok()
    }

    /// Seconds from the last frame send to the peer's echo of it.
    pub fn loop_time(&self) -> f64 {
        f64::from_bits(self.loop_time.load(Ordering::Acquire))
    }

    /// Advance the send frame counter; returns the new frame number.
    /// Counts in the wire's `u32` domain and wraps from `u32::MAX` to 0.
    pub fn iterate_frame_counter(&self) -> u32 {
        let previous = self.send_current.fetch_add(1, Ordering::AcqRel);
        self.send_previous.store(previous, Ordering::Release);
        *lock(&self.send_stamp) = Some(Instant::now());
        previous.wrapping_add(1)
    }

    /// Server: the peer echoed exactly the frame last sent, and it is a new echo.
    /// Client: a frame arrived that has not been acknowledged yet.
    pub fn is_updated(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.role {
            Role::Server => {
                let recv = self.recv_frame_current();
                recv == self.send_frame_current() && Some(recv) != self.recv_frame_previous()
            }
            Role::Client => self.updated.load(Ordering::Acquire),
        }
    }

    fn set_recv_frame(&self, frame: u32) {
        let previous = self.recv_current.swap(frame, Ordering::AcqRel);
        self.recv_previous.store(i64::from(previous), Ordering::Release);
        self.updated.store(frame != previous, Ordering::Release);
        if let Some(sent) = *lock(&self.send_stamp) {
            self.loop_time
                .store(sent.elapsed().as_secs_f64().to_bits(), Ordering::Release);
        }
    }

    /// Client side of the barrier: echo the frame most recently decoded back to the server.
    pub fn acknowledge(&self) -> Result<(), SendError> {
        let frame = self.recv_frame_current();
        let previous = self.send_current.swap(frame, Ordering::AcqRel);
        self.send_previous.store(previous, Ordering::Release);
        self.updated.store(false, Ordering::Release);
        self.send_message(MessageKind::Ack, frame, &[])
    }

    /// Send one message: header (kind, payload length, frame number) followed by `payload`.
    pub fn send_message(
        &self,
        kind: MessageKind,
        frame_number: u32,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.send_framed(wire::encode_message(kind, frame_number, payload))
    }

    /// Send a message that already carries its header. Written as one unit, never interleaved.
    /// Never blocks: fails with [`SendError::Full`] while the peer is not draining the queue.
    pub fn send_framed(&self, message: Vec<u8>) -> Result<(), SendError> {
        debug_assert!(message.len() >= HEADER_SIZE);
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full(self.id),
                TrySendError::Closed(_) => SendError::Closed(self.id),
            }),
            _ => Err(SendError::NotConnected(self.id)),
        }
    }

    /// Close the connection. Unless `forced`, tell the peer first and wait for the tasks to end.
    pub fn close(&self, forced: bool) {
        if !forced && self.is_connected() {
            if let Err(e) = self.send_message(MessageKind::Disconnect, 0, &[]) {
                debug!(id = self.id, "disconnect message not sent: {e}");
            }
        }
        info!(id = self.id, "closing connection");
        self.active.store(false, Ordering::Release);
        self.shutdown.send_replace(true);

        let task = lock(&self.task).take();
        let Some(task) = task else {
            return;
        };
        if forced {
            task.abort();
            // Ends the writer task, which half-closes the socket towards the peer.
            lock(&self.outbound).take();
            self.connected.store(false, Ordering::Release);
            return;
        }
        let (done, cvar) = &self.finished;
        let guard = lock(done);
        let (_guard, timeout) = cvar
            .wait_timeout_while(guard, CLOSE_TIMEOUT, |finished| !*finished)
            .unwrap_or_else(|e| e.into_inner());
        if timeout.timed_out() {
            warn!(id = self.id, "connection tasks did not finish in time, aborting");
            task.abort();
            lock(&self.outbound).take();
            self.connected.store(false, Ordering::Release);
        } else {
            info!(id = self.id, "connection successfully terminated");
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        match self.role {
            Role::Server => self.run_server(&mut shutdown).await,
            Role::Client => self.run_client(&mut shutdown).await,
        }
        info!(id = self.id, "exiting connection handler");
        let (done, cvar) = &self.finished;
        *lock(done) = true;
        cvar.notify_all();
    }

    async fn run_server(&self, shutdown: &mut watch::Receiver<bool>) {
        let listener = match TcpListener::bind((self.address.as_str(), self.port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(id = self.id, port = self.port, "bind failed: {e}");
                self.active.store(false, Ordering::Release);
                self.handler.on_status(self);
                return;
            }
        };
        while self.is_active() {
            info!(
                id = self.id,
                port = self.port,
                kind = %self.kind,
                "waiting for client to connect"
            );
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = stopped(shutdown) => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!(id = self.id, %peer, "client accepted");
                    self.serve(stream, shutdown).await;
                }
                Err(e) => {
                    warn!(id = self.id, "accept failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        _ = stopped(shutdown) => break,
                    }
                }
            }
        }
    }

    async fn run_client(&self, shutdown: &mut watch::Receiver<bool>) {
        let stream = loop {
            if !self.is_active() {
                return;
            }
            info!(
                id = self.id,
                ip = %self.address,
                port = self.port,
                kind = %self.kind,
                "attempting to connect to server"
            );
            let attempt = tokio::select! {
                r = TcpStream::connect((self.address.as_str(), self.port)) => r,
                _ = stopped(shutdown) => return,
            };
            match attempt {
                Ok(stream) => break stream,
                Err(e) => debug!(id = self.id, "waiting for connection: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = stopped(shutdown) => return,
            }
        };
        self.serve(stream, shutdown).await;
        // A client never reconnects: losing the server ends its part in the cluster.
        self.active.store(false, Ordering::Release);
    }

    async fn serve(&self, stream: TcpStream, shutdown: &mut watch::Receiver<bool>) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(id = self.id, "failed to set no-delay: {e}");
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        *lock(&self.outbound) = Some(tx);
        let writer_task = tokio::spawn(write_loop(self.id, writer, rx));
        // Also aborts the writer when this task is aborted by a forced close.
        let _writer_guard = AbortOnDrop(writer_task.abort_handle());

        self.connected.store(true, Ordering::Release);
        info!(id = self.id, "connection established");
        self.handler.on_status(self);

        let end = tokio::select! {
            r = self.read_loop(&mut reader) => r,
            _ = stopped(shutdown) => Ok(ReadEnd::Shutdown),
        };
        match end {
            Ok(ReadEnd::PeerClosed) => info!(id = self.id, "tcp connection closed"),
            Ok(ReadEnd::Disconnected) => info!(id = self.id, "peer terminated connection"),
            Ok(ReadEnd::Shutdown) => debug!(id = self.id, "read loop stopped for shutdown"),
            Err(e) => error!(id = self.id, "tcp connection receive failed: {e}"),
        }

        self.connected.store(false, Ordering::Release);
        self.updated.store(false, Ordering::Release);
        // Dropping the sender lets the writer flush what is queued (e.g. Disconnect) and stop.
        lock(&self.outbound).take();
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(id = self.id, "writer task failed: {e}"),
            Err(_) => warn!(id = self.id, "peer is not reading, dropping queued messages"),
        }
        self.handler.on_status(self);
        info!(id = self.id, "node disconnected");
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf) -> std::io::Result<ReadEnd> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let raw = match wire::read_header(reader).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(ReadEnd::PeerClosed)
                }
                Err(e) => return Err(e),
            };
            let header = match wire::decode_header(&raw) {
                Ok(h) => h,
                Err(HeaderError::UnknownKind { kind, payload_size }) => {
                    warn!(id = self.id, kind, payload_size, "skipping unknown message");
                    wire::read_payload(reader, &mut buf, payload_size as usize).await?;
                    continue;
                }
            };

            let len = header.payload_size as usize;
            if len > buf.len() {
                info!(id = self.id, "re-sizing buffer {} -> {}", buf.len(), len);
            }
            let payload = wire::read_payload(reader, &mut buf, len).await?;

            match header.kind {
                MessageKind::Data => self.on_data(header.frame_number, payload),
                MessageKind::CompressedData => {
                    if self.kind != ConnectionKind::DataTransfer {
                        warn!(id = self.id, "compressed data on a sync connection, ignored");
                        continue;
                    }
                    let inflated =
                        wire::inflate_payload(payload, header.uncompressed_size as usize)?;
                    self.on_data(header.frame_number, &inflated);
                }
                MessageKind::Ack => match self.kind {
                    ConnectionKind::Sync => {
                        self.set_recv_frame(header.frame_number);
                        self.handler.on_frame(self, header.frame_number);
                    }
                    ConnectionKind::DataTransfer => {
                        self.handler.on_acknowledged(self, header.frame_number)
                    }
                },
                MessageKind::Connected => self.handler.on_cluster_connected(self),
                MessageKind::Disconnect => return Ok(ReadEnd::Disconnected),
                MessageKind::Default => debug!(id = self.id, "ignoring filler header"),
            }
        }
    }

    fn on_data(&self, number: u32, payload: &[u8]) {
        match self.kind {
            ConnectionKind::Sync if self.is_server() => {
                // Frames only flow server to client; client echoes are header-only acks.
                warn!(id = self.id, frame = number, "data from a sync client, ignored");
            }
            ConnectionKind::Sync => {
                if !payload.is_empty() {
                    self.handler.on_data(self, number, payload);
                }
                // Record the frame only after decode, so a waiting render thread sees the data.
                self.set_recv_frame(number);
                self.handler.on_frame(self, number);
            }
            ConnectionKind::DataTransfer => {
                self.handler.on_data(self, number, payload);
                if let Err(e) = self.send_message(MessageKind::Ack, number, &[]) {
                    warn!(id = self.id, package = number, "acknowledge not sent: {e}");
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_loop(id: usize, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.write_all(&message).await {
            error!(id, "send data failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Resolves once shutdown was requested (immediately if it already was).
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
