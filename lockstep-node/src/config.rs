//! Load the cluster layout from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lockstep_core::{ClusterConfig, NodeConfig, SyncPolicy};
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/lockstep/cluster.toml or /etc/lockstep/cluster.toml.
/// Env overrides: LOCKSTEP_THIS_NODE, LOCKSTEP_SYNC_POLICY, LOCKSTEP_SYNC_TIMEOUT,
/// LOCKSTEP_TARGET_FPS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address this process runs as; must match a node entry (or the server address).
    #[serde(default)]
    pub this_node: Option<String>,
    /// Frame rate cap for the server and loose-sync clients (default 60, 0 = unpaced).
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    pub cluster: ClusterConfig,
}

fn default_target_fps() -> f64 {
    60.0
}

impl Default for Config {
    /// Two nodes on this machine: `127.0.0.1` serves, `localhost` is the client.
    fn default() -> Self {
        Self {
            this_node: None,
            target_fps: default_target_fps(),
            cluster: ClusterConfig {
                server_address: "127.0.0.1".to_string(),
                sync_policy: SyncPolicy::Firm,
                sync_timeout_secs: 60.0,
                nodes: vec![
                    NodeConfig {
                        address: "127.0.0.1".to_string(),
                        sync_port: 20400,
                        data_transfer_port: None,
                    },
                    NodeConfig {
                        address: "localhost".to_string(),
                        sync_port: 20401,
                        data_transfer_port: Some(20501),
                    },
                ],
            },
        }
    }
}

/// Load config: `explicit` path if given (must exist and parse), else the first config file
/// found, else defaults. Environment overrides are applied last.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(node) = var("LOCKSTEP_THIS_NODE").filter(|s| !s.is_empty()) {
        c.this_node = Some(node);
    }
    if let Some(s) = var("LOCKSTEP_SYNC_POLICY") {
        match s.parse::<SyncPolicy>() {
            Ok(policy) => c.cluster.sync_policy = policy,
            Err(e) => warn!("ignoring LOCKSTEP_SYNC_POLICY: {e}"),
        }
    }
    if let Some(s) = var("LOCKSTEP_TARGET_FPS") {
        match s.parse::<f64>() {
            Ok(fps) if fps >= 0.0 && fps.is_finite() => c.target_fps = fps,
            _ => warn!("ignoring LOCKSTEP_TARGET_FPS {s:?}"),
        }
    }
    if let Some(s) = var("LOCKSTEP_SYNC_TIMEOUT") {
        match s.parse::<f64>() {
            Ok(secs) if secs > 0.0 => c.cluster.sync_timeout_secs = secs,
            _ => warn!("ignoring LOCKSTEP_SYNC_TIMEOUT {s:?}"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lockstep/cluster.toml"));
    }
    out.push(PathBuf::from("/etc/lockstep/cluster.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("falling back to default config: {e:#}");
            None
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_node_file() {
        let c: Config = toml::from_str(
            r#"
            this_node = "10.0.0.2"

            [cluster]
            server_address = "10.0.0.1"
            sync_timeout_secs = 5.0

            [[cluster.nodes]]
            address = "10.0.0.2"
            sync_port = 20401
            data_transfer_port = 20501
            "#,
        )
        .unwrap();
        assert_eq!(c.this_node.as_deref(), Some("10.0.0.2"));
        assert_eq!(c.target_fps, 60.0);
        assert_eq!(c.cluster.sync_policy, SyncPolicy::Firm);
        assert_eq!(c.cluster.sync_timeout_secs, 5.0);
        assert_eq!(c.cluster.nodes[0].data_transfer_port, Some(20501));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1\n[cluster]\nserver_address = \"a\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LOCKSTEP_THIS_NODE", "localhost"),
            ("LOCKSTEP_SYNC_POLICY", "Loose"),
            ("LOCKSTEP_SYNC_TIMEOUT", "2.5"),
            ("LOCKSTEP_TARGET_FPS", "30"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.this_node.as_deref(), Some("localhost"));
        assert_eq!(c.cluster.sync_policy, SyncPolicy::Loose);
        assert_eq!(c.cluster.sync_timeout_secs, 2.5);
        assert_eq!(c.target_fps, 30.0);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "LOCKSTEP_SYNC_POLICY" => Some("strict".to_string()),
            "LOCKSTEP_SYNC_TIMEOUT" => Some("-1".to_string()),
            "LOCKSTEP_TARGET_FPS" => Some("fast".to_string()),
            _ => None,
        });
        assert_eq!(c, Config::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/lockstep/cluster.toml"))).is_err());
    }
}
