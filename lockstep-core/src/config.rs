//! Resolved cluster layout handed to [`crate::ClusterNetwork::new`]. Parsing files is the host's job.

use serde::Deserialize;

/// How strictly the host's frame loop honors the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Every frame waits until all sync connections acknowledged it.
    #[default]
    Firm,
    /// Frames proceed without waiting; nodes may drift apart.
    Loose,
    /// No transport at all (single-process mode).
    Ignore,
}

impl std::str::FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firm" => Ok(SyncPolicy::Firm),
            "loose" => Ok(SyncPolicy::Loose),
            "ignore" => Ok(SyncPolicy::Ignore),
            other => Err(format!("unknown sync policy {other:?}")),
        }
    }
}

/// How this process decides whether it is the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Server iff this node's address is the configured server address.
    #[default]
    Remote,
    /// Force server role; all peers are on this machine (127.0.0.1).
    LocalServer,
    /// Force client role; the server is on this machine (127.0.0.1).
    LocalClient,
}

/// One render node of the cluster (the server's own entry included, if listed).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Hostname or IP the node is known by.
    pub address: String,
    /// Port of this node's sync connection (the server listens on it).
    pub sync_port: u16,
    /// Port of this node's data-transfer connection, if it has one.
    #[serde(default)]
    pub data_transfer_port: Option<u16>,
}

/// Cluster description: the server plus every node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Address of the node that drives frames.
    pub server_address: String,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Seconds a firm-sync wait may stall before the host gives up.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: f64,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_sync_timeout_secs() -> f64 {
    60.0
}

impl ClusterConfig {
    /// Node entry whose address matches `address` (case-insensitive).
    pub fn node(&self, address: &str) -> Option<&NodeConfig> {
        self.nodes
            .iter()
            .find(|n| n.address.eq_ignore_ascii_case(address))
    }
}
