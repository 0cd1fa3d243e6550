//! Cluster network: owns every connection, resolves the role, drives the frame barrier.
//!
//! The host constructs one [`ClusterNetwork`] and calls [`ClusterNetwork::sync`] once per frame
//! from its render thread. On the server that stamps the encoded [`SharedData`] block with each
//! connection's next frame number and sends it; clients decode it on arrival and echo the frame
//! number back with `sync(SyncMode::Acknowledge)`. [`ClusterNetwork::is_sync_complete`] is the
//! barrier predicate the host polls (or waits on with [`ClusterNetwork::wait_for_sync`]).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, NetworkMode, SyncPolicy};
use crate::connection::{Connection, ConnectionHandler, ConnectionParams, DEFAULT_BUFFER_SIZE};
use crate::protocol::{ConnectionKind, MessageKind, Role};
use crate::shared::SharedData;
use crate::wire;

/// Default zlib level for compressed data transfer.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// What a `sync` call does this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Server: encode shared data and send it, frame-numbered, to every client.
    SendDataToClients,
    /// Client: echo the frame just decoded back to the server.
    Acknowledge,
}

/// Host hooks for connection state and out-of-band packages. Called on runtime threads.
pub trait ClusterObserver: Send + Sync {
    /// A connection came up or went down.
    fn on_connection_status(&self, _connection: usize, _kind: ConnectionKind, _connected: bool) {}

    /// A data-transfer package arrived.
    fn on_package(&self, _connection: usize, _package_id: u32, _payload: &[u8]) {}

    /// The peer confirmed a package sent with [`ClusterNetwork::transfer_data`].
    fn on_package_acknowledged(&self, _connection: usize, _package_id: u32) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ClusterObserver for NoopObserver {}

/// Error setting up or using the cluster network.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no address information for this node")]
    MissingNodeAddress,
    #[error("no address information for the server")]
    MissingServerAddress,
    #[error("node {0} is not part of the cluster configuration")]
    UnknownNode(String),
    #[error("no port provided for connection to {0}")]
    MissingPort(String),
    #[error("port {port} is already used by connection {connection}")]
    PortInUse { port: u16, connection: usize },
    #[error("connection {0} is not a data transfer connection")]
    NotDataTransfer(usize),
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Owns all connections of this node.
pub struct ClusterNetwork {
    state: Arc<ClusterState>,
    connections: Vec<Arc<Connection>>,
    sync_connections: Vec<usize>,
    data_transfer_connections: Vec<usize>,
    policy: SyncPolicy,
    compress: AtomicBool,
    compression_level: AtomicU32,
    closed: AtomicBool,
}

impl ClusterNetwork {
    /// Resolve this node's role from `config` and open one connection per configured link.
    ///
    /// Server: one listening sync connection (plus a data-transfer one, if the node declares a
    /// port) for every node other than itself. Client: one sync connection to the server on its
    /// own sync port, plus its data-transfer connection if it has one.
    pub fn new(
        runtime: &Handle,
        config: &ClusterConfig,
        this_node: &str,
        mode: NetworkMode,
        shared: Arc<SharedData>,
        observer: Arc<dyn ClusterObserver>,
    ) -> Result<Self, NetworkError> {
        if this_node.is_empty() {
            return Err(NetworkError::MissingNodeAddress);
        }
        if mode == NetworkMode::Remote && config.server_address.is_empty() {
            return Err(NetworkError::MissingServerAddress);
        }

        let is_server = match mode {
            NetworkMode::Remote => this_node.eq_ignore_ascii_case(&config.server_address),
            NetworkMode::LocalServer => true,
            NetworkMode::LocalClient => false,
        };
        if is_server {
            info!("this computer is the network server");
        } else {
            info!("this computer is the network client");
        }

        let links = plan_links(config, this_node, mode, is_server)?;
        debug!(
            "cluster sync: {}",
            match config.sync_policy {
                SyncPolicy::Firm => "firm",
                SyncPolicy::Loose => "loose",
                SyncPolicy::Ignore => "ignore",
            }
        );

        let state = Arc::new(ClusterState::new(is_server, shared.clone(), observer));
        let role = if is_server { Role::Server } else { Role::Client };
        let sync_buffer = shared.buffer_size().max(DEFAULT_BUFFER_SIZE);
        let connections: Vec<Arc<Connection>> = links
            .into_iter()
            .enumerate()
            .map(|(id, link)| {
                debug!(id, port = link.port, "initiating connection");
                let buffer_size = match link.kind {
                    ConnectionKind::Sync => sync_buffer,
                    ConnectionKind::DataTransfer => DEFAULT_BUFFER_SIZE,
                };
                Connection::open(
                    runtime,
                    ConnectionParams {
                        id,
                        address: link.address,
                        port: link.port,
                        role,
                        kind: link.kind,
                        buffer_size,
                    },
                    state.clone(),
                )
            })
            .collect();

        let index_of = |kind: ConnectionKind| -> Vec<usize> {
            connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.kind() == kind)
                .map(|(i, _)| i)
                .collect()
        };
        let sync_connections = index_of(ConnectionKind::Sync);
        let data_transfer_connections = index_of(ConnectionKind::DataTransfer);

        let _ = state
            .connections
            .set(connections.iter().map(Arc::downgrade).collect());
        // Connections may have come up before the list was visible to the status handler.
        state.refresh_status(None);

        Ok(Self {
            state,
            connections,
            sync_connections,
            data_transfer_connections,
            policy: config.sync_policy,
            compress: AtomicBool::new(false),
            compression_level: AtomicU32::new(DEFAULT_COMPRESSION_LEVEL),
            closed: AtomicBool::new(false),
        })
    }

    /// Send this frame's data (server) or acknowledge the received frame (client).
    /// Returns the min/max round-trip seconds over the clients sent to, `None` otherwise.
    pub fn sync(&self, mode: SyncMode) -> Option<(f64, f64)> {
        if self.sync_connections.is_empty() {
            return None;
        }
        match mode {
            SyncMode::SendDataToClients => {
                let targets: Vec<&Arc<Connection>> = self
                    .sync_iter()
                    .filter(|c| c.is_server() && c.is_connected())
                    .collect();
                if targets.is_empty() {
                    return None;
                }

                self.state.shared.encode();
                let block = self.state.shared.snapshot();
                let mut min = f64::MAX;
                let mut max = f64::MIN;
                for conn in targets {
                    let loop_time = conn.loop_time();
                    min = min.min(loop_time);
                    max = max.max(loop_time);

                    let frame = conn.iterate_frame_counter();
                    let mut message = block.clone();
                    wire::stamp_header(&mut message, MessageKind::Data, frame);
                    if let Err(e) = conn.send_framed(message) {
                        warn!(id = conn.id(), frame, "frame not sent: {e}");
                    }
                }
                Some((min, max))
            }
            SyncMode::Acknowledge => {
                for conn in self
                    .sync_iter()
                    .filter(|c| !c.is_server() && c.is_connected())
                {
                    if let Err(e) = conn.acknowledge() {
                        warn!(id = conn.id(), "acknowledge not sent: {e}");
                    }
                }
                None
            }
        }
    }

    /// Barrier predicate: every connected sync connection has an update for this frame.
    pub fn is_sync_complete(&self) -> bool {
        let mut connected = 0usize;
        let mut updated = 0usize;
        for conn in self.sync_iter() {
            if conn.is_connected() {
                connected += 1;
                if conn.is_updated() {
                    updated += 1;
                }
            }
        }
        updated == connected
    }

    /// Server: every configured connection is up. Client: connected, and the server said the
    /// whole cluster is.
    pub fn are_all_nodes_connected(&self) -> bool {
        self.state.all_nodes_connected.load(Ordering::Acquire)
    }

    /// False after shutdown, or on a client once its server is gone.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn is_server(&self) -> bool {
        self.state.is_server
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Send an out-of-band package on every connected data-transfer connection, or only on
    /// `connection`. Returns how many connections it was queued on.
    pub fn transfer_data(
        &self,
        payload: &[u8],
        package_id: u32,
        connection: Option<usize>,
    ) -> Result<usize, NetworkError> {
        let message = if self.compress.load(Ordering::Acquire) {
            let level = self.compression_level.load(Ordering::Acquire);
            wire::encode_compressed_message(package_id, payload, level)?
        } else {
            wire::encode_message(MessageKind::Data, package_id, payload)
        };

        let targets: Vec<&Arc<Connection>> = match connection {
            Some(i) => {
                let conn = self
                    .connections
                    .get(i)
                    .filter(|c| c.kind() == ConnectionKind::DataTransfer)
                    .ok_or(NetworkError::NotDataTransfer(i))?;
                vec![conn]
            }
            None => self
                .data_transfer_connections
                .iter()
                .map(|&i| &self.connections[i])
                .collect(),
        };

        let mut sent = 0;
        for conn in targets.into_iter().filter(|c| c.is_connected()) {
            match conn.send_framed(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(id = conn.id(), package_id, "package not sent: {e}"),
            }
        }
        Ok(sent)
    }

    /// Compress data-transfer packages with zlib at `level` (0-9).
    pub fn set_data_transfer_compression(&self, enabled: bool, level: u32) {
        self.compress.store(enabled, Ordering::Release);
        self.compression_level.store(level.min(9), Ordering::Release);
    }

    /// Block until any connection reports something (data, echo, status) or `timeout` passes.
    /// Returns false on timeout.
    pub fn wait_for_update(&self, timeout: Duration) -> bool {
        let (generation, cvar) = &self.state.signal;
        let guard = lock(generation);
        let start = *guard;
        let (_guard, result) = cvar
            .wait_timeout_while(guard, timeout, |g| *g == start)
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }

    /// Block until [`Self::is_sync_complete`] holds, the network stops running, or `timeout`
    /// passes. Returns whether the barrier completed.
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.is_sync_complete() || !self.is_running());
        self.is_sync_complete()
    }

    /// Block until every node is connected, the network stops running, or `timeout` passes.
    pub fn wait_for_all_nodes(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            self.are_all_nodes_connected() || !self.is_running()
        });
        self.are_all_nodes_connected()
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        let (generation, cvar) = &self.state.signal;
        let mut guard = lock(generation);
        // Connection tasks bump the generation under this lock after updating their state,
        // so checking `done` while holding it cannot miss a wakeup.
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            guard = cvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Connections currently up, of any kind.
    pub fn active_connections_count(&self) -> usize {
        self.state.active_connections.load(Ordering::Acquire)
    }

    pub fn active_sync_connections_count(&self) -> usize {
        self.state.active_sync.load(Ordering::Acquire)
    }

    pub fn connections_count(&self) -> usize {
        self.connections.len()
    }

    pub fn sync_connections_count(&self) -> usize {
        self.sync_connections.len()
    }

    pub fn data_transfer_connections_count(&self) -> usize {
        self.data_transfer_connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<&Arc<Connection>> {
        self.connections.get(index)
    }

    pub fn sync_connection(&self, index: usize) -> Option<&Arc<Connection>> {
        self.sync_connections
            .get(index)
            .map(|&i| &self.connections[i])
    }

    /// Close every connection gracefully and drop the shared data callbacks. Also runs on drop.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.running.store(false, Ordering::Release);
        self.state.closing.store(true, Ordering::Release);
        self.state.shared.clear_callbacks();
        self.state.notify();
        for conn in &self.connections {
            conn.close(false);
        }
        info!("network closed");
    }

    fn sync_iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.sync_connections.iter().map(|&i| &self.connections[i])
    }
}

impl Drop for ClusterNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Link {
    address: String,
    port: u16,
    kind: ConnectionKind,
}

fn plan_links(
    config: &ClusterConfig,
    this_node: &str,
    mode: NetworkMode,
    is_server: bool,
) -> Result<Vec<Link>, NetworkError> {
    let local = mode != NetworkMode::Remote;
    let mut links = Vec::new();
    if is_server {
        let bind = if local { "127.0.0.1" } else { "0.0.0.0" };
        for node in config
            .nodes
            .iter()
            .filter(|n| !n.address.eq_ignore_ascii_case(this_node))
        {
            push_node_links(&mut links, bind, &node.address, node.sync_port, node.data_transfer_port);
        }
    } else {
        let node = config
            .node(this_node)
            .ok_or_else(|| NetworkError::UnknownNode(this_node.to_string()))?;
        let remote = if local {
            "127.0.0.1"
        } else {
            config.server_address.as_str()
        };
        push_node_links(&mut links, remote, &node.address, node.sync_port, node.data_transfer_port);
    }

    for (i, link) in links.iter().enumerate() {
        if link.port == 0 {
            return Err(NetworkError::MissingPort(link.address.clone()));
        }
        if let Some(j) = links[..i].iter().position(|l| l.port == link.port) {
            return Err(NetworkError::PortInUse {
                port: link.port,
                connection: j,
            });
        }
    }
    Ok(links)
}

fn push_node_links(
    links: &mut Vec<Link>,
    address: &str,
    node: &str,
    sync_port: u16,
    data_transfer_port: Option<u16>,
) {
    debug!(node, sync_port, ?data_transfer_port, "adding node links");
    links.push(Link {
        address: address.to_string(),
        port: sync_port,
        kind: ConnectionKind::Sync,
    });
    if let Some(port) = data_transfer_port {
        links.push(Link {
            address: address.to_string(),
            port,
            kind: ConnectionKind::DataTransfer,
        });
    }
}

/// State shared with the connection tasks; it is every connection's handler.
struct ClusterState {
    is_server: bool,
    shared: Arc<SharedData>,
    observer: Arc<dyn ClusterObserver>,
    connections: OnceLock<Vec<Weak<Connection>>>,
    running: AtomicBool,
    closing: AtomicBool,
    all_nodes_connected: AtomicBool,
    /// Client: the server announced that the cluster is complete.
    cluster_announced: AtomicBool,
    /// Client: its sync connection was up at least once.
    sync_seen: AtomicBool,
    active_connections: AtomicUsize,
    active_sync: AtomicUsize,
    active_data_transfer: AtomicUsize,
    signal: (Mutex<u64>, Condvar),
}

impl ClusterState {
    fn new(is_server: bool, shared: Arc<SharedData>, observer: Arc<dyn ClusterObserver>) -> Self {
        Self {
            is_server,
            shared,
            observer,
            connections: OnceLock::new(),
            running: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            all_nodes_connected: AtomicBool::new(false),
            cluster_announced: AtomicBool::new(false),
            sync_seen: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            active_sync: AtomicUsize::new(0),
            active_data_transfer: AtomicUsize::new(0),
            signal: (Mutex::new(0), Condvar::new()),
        }
    }

    /// Wake every render-thread waiter.
    fn notify(&self) {
        let (generation, cvar) = &self.signal;
        *lock(generation) += 1;
        cvar.notify_all();
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .get()
            .map(|list| list.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Recount connections, update the cluster flags and, on the server, announce a complete
    /// cluster to every client. `changed` is the connection that triggered the update.
    fn refresh_status(&self, changed: Option<&Connection>) {
        if let Some(conn) = changed {
            debug!(id = conn.id(), "updating status for connection");
        }
        let Some(list) = self.connections.get() else {
            return;
        };
        let conns = self.live_connections();
        let total = list.len();
        let total_sync = conns.iter().filter(|c| c.kind() == ConnectionKind::Sync).count();
        let total_data_transfer = total - total_sync;

        let mut n_connected = 0;
        let mut n_sync = 0;
        let mut n_data_transfer = 0;
        for conn in conns.iter().filter(|c| c.is_connected()) {
            n_connected += 1;
            match conn.kind() {
                ConnectionKind::Sync => n_sync += 1,
                ConnectionKind::DataTransfer => n_data_transfer += 1,
            }
        }

        info!("number of active connections {} of {}", n_connected, total);
        debug!("number of connected sync nodes {} of {}", n_sync, total_sync);
        debug!(
            "number of connected data transfer nodes {} of {}",
            n_data_transfer, total_data_transfer
        );

        self.active_connections.store(n_connected, Ordering::Release);
        self.active_sync.store(n_sync, Ordering::Release);
        self.active_data_transfer
            .store(n_data_transfer, Ordering::Release);

        if self.is_server {
            let all = n_sync == total_sync && n_data_transfer == total_data_transfer;
            self.all_nodes_connected.store(all, Ordering::Release);
            if all && changed.map_or(true, |c| c.is_connected()) {
                for conn in conns.iter().filter(|c| c.is_connected()) {
                    if let Err(e) = conn.send_message(MessageKind::Connected, 0, &[]) {
                        warn!(id = conn.id(), "cluster connected message not sent: {e}");
                    }
                }
            }
        } else {
            if n_sync > 0 {
                self.sync_seen.store(true, Ordering::Release);
            } else {
                self.cluster_announced.store(false, Ordering::Release);
                // A client without its server cannot run anymore.
                if self.sync_seen.load(Ordering::Acquire) {
                    self.running.store(false, Ordering::Release);
                }
            }
            self.update_client_all_connected();
        }
    }

    fn update_client_all_connected(&self) {
        let conns = self.live_connections();
        let total_data_transfer = conns
            .iter()
            .filter(|c| c.kind() == ConnectionKind::DataTransfer)
            .count();
        let all = self.cluster_announced.load(Ordering::Acquire)
            && self.active_sync.load(Ordering::Acquire) == 1
            && self.active_data_transfer.load(Ordering::Acquire) == total_data_transfer;
        self.all_nodes_connected.store(all, Ordering::Release);
    }
}

impl ConnectionHandler for ClusterState {
    fn on_data(&self, conn: &Connection, number: u32, payload: &[u8]) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        match conn.kind() {
            ConnectionKind::Sync => self.shared.decode(payload),
            ConnectionKind::DataTransfer => {
                debug!(id = conn.id(), package = number, "decoding package");
                self.observer.on_package(conn.id(), number, payload);
            }
        }
    }

    fn on_frame(&self, _conn: &Connection, _frame: u32) {
        self.notify();
    }

    fn on_acknowledged(&self, conn: &Connection, package_id: u32) {
        debug!(id = conn.id(), package = package_id, "package received by peer");
        self.observer.on_package_acknowledged(conn.id(), package_id);
        self.notify();
    }

    fn on_status(&self, conn: &Connection) {
        self.refresh_status(Some(conn));
        self.observer
            .on_connection_status(conn.id(), conn.kind(), conn.is_connected());
        self.notify();
    }

    fn on_cluster_connected(&self, conn: &Connection) {
        if !self.is_server {
            debug!(id = conn.id(), "server reports all nodes connected");
            self.cluster_announced.store(true, Ordering::Release);
            self.update_client_all_connected();
        }
        self.notify();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn node(address: &str, sync_port: u16, data_transfer_port: Option<u16>) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            sync_port,
            data_transfer_port,
        }
    }

    fn cluster(nodes: Vec<NodeConfig>) -> ClusterConfig {
        ClusterConfig {
            server_address: "10.0.0.1".to_string(),
            sync_policy: SyncPolicy::Firm,
            sync_timeout_secs: 60.0,
            nodes,
        }
    }

    fn open(
        rt: &tokio::runtime::Runtime,
        config: &ClusterConfig,
        this_node: &str,
        mode: NetworkMode,
    ) -> Result<ClusterNetwork, NetworkError> {
        ClusterNetwork::new(
            rt.handle(),
            config,
            this_node,
            mode,
            Arc::new(SharedData::new()),
            Arc::new(NoopObserver),
        )
    }

    #[test]
    fn server_role_from_address() {
        let rt = runtime();
        let config = cluster(vec![
            node("10.0.0.1", free_port(), None),
            node("10.0.0.2", free_port(), Some(free_port())),
            node("10.0.0.3", free_port(), None),
        ]);
        // Remote mode binds 0.0.0.0 on the configured ports.
        let net = open(&rt, &config, "10.0.0.1", NetworkMode::Remote).unwrap();
        assert!(net.is_server());
        assert_eq!(net.sync_connections_count(), 2);
        assert_eq!(net.data_transfer_connections_count(), 1);
        assert_eq!(net.connections_count(), 3);
        assert!(!net.are_all_nodes_connected());
        // No client is connected, so there is nothing to wait for and nothing to send to.
        assert!(net.is_sync_complete());
        assert_eq!(net.sync(SyncMode::SendDataToClients), None);
        net.shutdown();
        assert!(!net.is_running());
    }

    #[test]
    fn client_role_connects_to_own_ports() {
        let rt = runtime();
        let sync_port = free_port();
        let config = cluster(vec![
            node("10.0.0.1", free_port(), None),
            node("render-2", sync_port, Some(free_port())),
        ]);
        let net = open(&rt, &config, "RENDER-2", NetworkMode::LocalClient).unwrap();
        assert!(!net.is_server());
        assert_eq!(net.connections_count(), 2);
        let sync = net.sync_connection(0).unwrap();
        assert_eq!(sync.port(), sync_port);
        assert_eq!(sync.address(), "127.0.0.1");
        assert_eq!(sync.role(), Role::Client);
        // Never connected yet: still running, and acknowledging is a no-op.
        assert!(net.is_running());
        assert_eq!(net.sync(SyncMode::Acknowledge), None);
    }

    #[test]
    fn lone_server_is_complete() {
        let rt = runtime();
        let config = cluster(vec![node("10.0.0.1", free_port(), None)]);
        let net = open(&rt, &config, "10.0.0.1", NetworkMode::Remote).unwrap();
        assert_eq!(net.connections_count(), 0);
        assert!(net.are_all_nodes_connected());
        assert!(net.is_sync_complete());
        assert_eq!(net.sync(SyncMode::SendDataToClients), None);
    }

    #[test]
    fn unknown_client_node_rejected() {
        let rt = runtime();
        let config = cluster(vec![node("10.0.0.2", free_port(), None)]);
        assert!(matches!(
            open(&rt, &config, "10.0.0.9", NetworkMode::Remote),
            Err(NetworkError::UnknownNode(n)) if n == "10.0.0.9"
        ));
    }

    #[test]
    fn invalid_layouts_rejected() {
        let rt = runtime();
        assert!(matches!(
            open(&rt, &cluster(vec![]), "", NetworkMode::Remote),
            Err(NetworkError::MissingNodeAddress)
        ));

        let mut no_server = cluster(vec![]);
        no_server.server_address.clear();
        assert!(matches!(
            open(&rt, &no_server, "10.0.0.2", NetworkMode::Remote),
            Err(NetworkError::MissingServerAddress)
        ));

        let zero = cluster(vec![node("10.0.0.2", 0, None)]);
        assert!(matches!(
            open(&rt, &zero, "10.0.0.1", NetworkMode::LocalServer),
            Err(NetworkError::MissingPort(_))
        ));

        let port = free_port();
        let dup = cluster(vec![node("10.0.0.2", port, None), node("10.0.0.3", port, None)]);
        assert!(matches!(
            open(&rt, &dup, "10.0.0.1", NetworkMode::LocalServer),
            Err(NetworkError::PortInUse { connection: 0, .. })
        ));
    }

    #[test]
    fn transfer_to_non_transfer_connection_rejected() {
        let rt = runtime();
        let config = cluster(vec![node("10.0.0.2", free_port(), None)]);
        let net = open(&rt, &config, "10.0.0.1", NetworkMode::LocalServer).unwrap();
        assert!(matches!(
            net.transfer_data(b"x", 1, Some(0)),
            Err(NetworkError::NotDataTransfer(0))
        ));
        // Broadcast with nobody connected queues nothing.
        assert_eq!(net.transfer_data(b"x", 1, None).unwrap(), 0);
    }

    #[test]
    fn wait_for_update_times_out() {
        let rt = runtime();
        let config = cluster(vec![node("10.0.0.2", free_port(), None)]);
        let net = open(&rt, &config, "10.0.0.1", NetworkMode::LocalServer).unwrap();
        let started = Instant::now();
        assert!(!net.wait_for_update(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!net.wait_for_all_nodes(Duration::from_millis(20)));
    }
}
