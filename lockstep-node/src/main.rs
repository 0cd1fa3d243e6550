// Lockstep node: runs the frame-locked loop as cluster server or client.

mod config;
mod frame_loop;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use lockstep_core::{ClusterNetwork, NetworkMode, NoopObserver, SharedData, SyncPolicy};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use frame_loop::FrameLoop;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    config: Option<PathBuf>,
    node: Option<String>,
    mode: NetworkMode,
    frames: Option<u64>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" => out.config = Some(args.next().context("--config needs a path")?.into()),
            "--node" => out.node = Some(args.next().context("--node needs an address")?),
            "--local-server" => out.mode = NetworkMode::LocalServer,
            "--local-client" => out.mode = NetworkMode::LocalClient,
            "--frames" => {
                let n = args.next().context("--frames needs a count")?;
                out.frames = Some(n.parse().with_context(|| format!("bad frame count {n:?}"))?);
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("lockstep-node {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(args.config.as_deref())?;
    let this_node = args
        .node
        .or(cfg.this_node.clone())
        .or_else(|| {
            (args.mode == NetworkMode::LocalServer).then(|| cfg.cluster.server_address.clone())
        })
        .context("no node address: pass --node or set LOCKSTEP_THIS_NODE")?;
    let policy = cfg.cluster.sync_policy;
    let sync_timeout = Duration::try_from_secs_f64(cfg.cluster.sync_timeout_secs)
        .context("sync timeout out of range")?;

    let rt = tokio::runtime::Runtime::new()?;
    let shared = Arc::new(SharedData::new());
    let network = if policy == SyncPolicy::Ignore {
        info!("sync policy is ignore: running without network");
        None
    } else {
        Some(ClusterNetwork::new(
            rt.handle(),
            &cfg.cluster,
            &this_node,
            args.mode,
            shared.clone(),
            Arc::new(NoopObserver),
        )?)
    };
    let frame_loop =
        FrameLoop::new(network, &shared, policy, sync_timeout).with_target_fps(cfg.target_fps);

    let stop = frame_loop.stop_handle();
    rt.spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!("signal handler failed: {e}");
            return;
        }
        info!("shutdown requested");
        stop.store(true, Ordering::Release);
    });

    let result = if frame_loop.wait_for_cluster() {
        frame_loop.run(args.frames).map(|_| ())
    } else {
        Ok(())
    };
    frame_loop.shutdown();
    drop(frame_loop);
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_local_client() {
        let a = args(&["--local-client", "--node", "localhost", "--frames", "10"]).unwrap();
        assert_eq!(a.mode, NetworkMode::LocalClient);
        assert_eq!(a.node.as_deref(), Some("localhost"));
        assert_eq!(a.frames, Some(10));
        assert!(!a.version);
    }

    #[test]
    fn parses_config_path() {
        let a = args(&["--config", "/tmp/cluster.toml", "--local-server"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/tmp/cluster.toml")));
        assert_eq!(a.mode, NetworkMode::LocalServer);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(args(&["--frames"]).is_err());
        assert!(args(&["--frames", "many"]).is_err());
        assert!(args(&["--proxy"]).is_err());
    }

    #[test]
    fn empty_is_remote() {
        assert_eq!(args(&[]).unwrap(), Args::default());
    }
}
