//! Frame-locked render loop over a [`ClusterNetwork`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use lockstep_core::{
    deserialize, serialize, ClusterNetwork, CodecError, SharedData, SyncMode, SyncPolicy,
};
use tracing::{debug, error, info};

/// Waits are sliced so a stalled peer is reported once per slice.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// State the server drives and every client renders.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DemoState {
    /// Seconds since the server started its loop.
    pub time: f64,
    pub frame: u64,
    pub status: String,
}

impl DemoState {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 4 + self.status.len());
        serialize(&mut buf, &self.time);
        serialize(&mut buf, &self.frame);
        serialize(&mut buf, self.status.as_str());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        Ok(Self {
            time: deserialize(payload, &mut pos)?,
            frame: deserialize(payload, &mut pos)?,
            status: deserialize(payload, &mut pos)?,
        })
    }
}

pub struct FrameLoop {
    /// `None` under [`SyncPolicy::Ignore`]: frames run without any transport.
    network: Option<ClusterNetwork>,
    state: Arc<Mutex<DemoState>>,
    policy: SyncPolicy,
    sync_timeout: Duration,
    started: Instant,
    stop: Arc<AtomicBool>,
    /// Minimum time between frames; `None` runs unpaced.
    frame_interval: Option<Duration>,
}

impl FrameLoop {
    /// Hook the demo state into `shared`: the server encodes it, clients decode into it.
    pub fn new(
        network: Option<ClusterNetwork>,
        shared: &SharedData,
        policy: SyncPolicy,
        sync_timeout: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(DemoState::default()));

        let source = state.clone();
        shared.set_encoder(move || lock(&source).encode());
        let sink = state.clone();
        shared.set_decoder(move |payload| match DemoState::decode(payload) {
            Ok(decoded) => *lock(&sink) = decoded,
            Err(e) => error!("dropping undecodable frame state: {e}"),
        });

        Self {
            network,
            state,
            policy,
            sync_timeout,
            started: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
            frame_interval: None,
        }
    }

    /// Cap the loop at `fps` frames per second; `0` leaves it unpaced.
    /// A client under firm sync is paced by its server and ignores this.
    pub fn with_target_fps(mut self, fps: f64) -> Self {
        self.frame_interval = (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        self
    }

    /// Raising this flag ends the loop at the next wait or frame boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DemoState {
        lock(&self.state).clone()
    }

    fn is_server(&self) -> bool {
        self.network.as_ref().map_or(true, ClusterNetwork::is_server)
    }

    /// False once the client lost its server or the network was shut down.
    pub fn is_running(&self) -> bool {
        self.network.as_ref().map_or(true, ClusterNetwork::is_running)
    }

    /// Block until the whole cluster is connected, or the loop is stopped.
    pub fn wait_for_cluster(&self) -> bool {
        let Some(net) = &self.network else {
            return true;
        };
        info!("waiting for all nodes to connect");
        while !self.stopped() && net.is_running() {
            if net.wait_for_all_nodes(WAIT_SLICE) {
                info!("all nodes connected");
                return true;
            }
            debug!(
                "{} of {} connections up",
                net.active_connections_count(),
                net.connections_count()
            );
        }
        false
    }

    /// Server: advance and send this frame's state. Client: wait for it (firm sync) and
    /// acknowledge it.
    pub fn pre_stage(&self) -> anyhow::Result<()> {
        if self.is_server() {
            {
                let mut state = lock(&self.state);
                state.frame += 1;
                state.time = self.started.elapsed().as_secs_f64();
                state.status = format!("frame {}", state.frame);
            }
            if let Some(net) = &self.network {
                if let Some((min, max)) = net.sync(SyncMode::SendDataToClients) {
                    debug!("round trip min {:.4}s max {:.4}s", min, max);
                }
            }
            return Ok(());
        }

        let Some(net) = &self.network else {
            return Ok(());
        };
        if self.policy == SyncPolicy::Firm {
            self.wait_for_sync(net, "server")?;
        } else if !net.is_sync_complete() {
            // Nothing new from the server; render the last frame again.
            return Ok(());
        }
        net.sync(SyncMode::Acknowledge);
        Ok(())
    }

    pub fn render(&self) {
        let state = lock(&self.state);
        debug!(
            frame = state.frame,
            time = state.time,
            status = %state.status,
            "render"
        );
    }

    /// Server under firm sync: wait until every client acknowledged this frame.
    pub fn post_stage(&self) -> anyhow::Result<()> {
        let Some(net) = &self.network else {
            return Ok(());
        };
        if self.policy != SyncPolicy::Firm || !net.is_server() {
            return Ok(());
        }
        if net.active_connections_count() == 0 {
            return Ok(());
        }
        self.wait_for_sync(net, "clients")
    }

    fn wait_for_sync(&self, net: &ClusterNetwork, peer: &str) -> anyhow::Result<()> {
        let started = Instant::now();
        while net.is_running() && !self.stopped() {
            if net.wait_for_sync(WAIT_SLICE) {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.sync_timeout {
                bail!(
                    "no sync signal from {peer} after {:.1} seconds",
                    self.sync_timeout.as_secs_f64()
                );
            }
            for i in 0..net.sync_connections_count() {
                if let Some(conn) = net.sync_connection(i).filter(|c| !c.is_updated()) {
                    info!(
                        id = conn.id(),
                        "waiting for {peer}: send frame {} recv frame {} ({:.1}s)",
                        conn.send_frame_current(),
                        conn.recv_frame_current(),
                        waited.as_secs_f64()
                    );
                }
            }
        }
        Ok(())
    }

    /// Run frames until stopped, the network stops, or `frames` have been rendered.
    /// Returns the number of frames rendered.
    pub fn run(&self, frames: Option<u64>) -> anyhow::Result<u64> {
        let mut rendered = 0;
        let mut next_frame = Instant::now();
        while !self.stopped() && self.is_running() {
            if frames.is_some_and(|n| rendered >= n) {
                break;
            }
            self.pre_stage()?;
            if !self.is_running() || self.stopped() {
                break;
            }
            self.render();
            self.post_stage()?;
            rendered += 1;
            self.pace(&mut next_frame);
        }
        info!(rendered, "frame loop finished");
        Ok(rendered)
    }

    fn pace(&self, next_frame: &mut Instant) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        if !self.is_server() && self.policy == SyncPolicy::Firm {
            return;
        }
        *next_frame += interval;
        let now = Instant::now();
        if *next_frame > now {
            std::thread::sleep(*next_frame - now);
        } else {
            // Running behind: do not try to catch up with a burst of frames.
            *next_frame = now;
        }
    }

    /// Shut the network down, if there is one.
    pub fn shutdown(&self) {
        if let Some(net) = &self.network {
            net.shutdown();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_state_round_trip() {
        let state = DemoState {
            time: 1.25,
            frame: 42,
            status: "frame 42".to_string(),
        };
        let bytes = state.encode();
        assert_eq!(bytes.len(), 8 + 8 + 4 + 8);
        assert_eq!(DemoState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn truncated_state_is_an_error() {
        let bytes = DemoState::default().encode();
        assert!(DemoState::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn ignore_policy_runs_without_network() {
        let shared = SharedData::new();
        let frame_loop = FrameLoop::new(None, &shared, SyncPolicy::Ignore, Duration::from_secs(1));
        assert!(frame_loop.wait_for_cluster());
        assert_eq!(frame_loop.run(Some(3)).unwrap(), 3);
        assert_eq!(frame_loop.state().frame, 3);
        assert_eq!(frame_loop.state().status, "frame 3");
    }

    #[test]
    fn encoder_and_decoder_share_the_state() {
        let shared = SharedData::new();
        let frame_loop = FrameLoop::new(None, &shared, SyncPolicy::Ignore, Duration::from_secs(1));
        frame_loop.run(Some(2)).unwrap();

        shared.encode();
        let block = shared.snapshot();
        let sent = DemoState::decode(&block[lockstep_core::HEADER_SIZE..]).unwrap();
        assert_eq!(sent.frame, 2);

        let incoming = DemoState {
            time: 9.0,
            frame: 77,
            status: "remote".to_string(),
        };
        shared.decode(&incoming.encode());
        assert_eq!(frame_loop.state(), incoming);
    }

    #[test]
    fn target_fps_paces_frames() {
        let shared = SharedData::new();
        let frame_loop = FrameLoop::new(None, &shared, SyncPolicy::Loose, Duration::from_secs(1))
            .with_target_fps(100.0);
        let started = Instant::now();
        assert_eq!(frame_loop.run(Some(5)).unwrap(), 5);
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn zero_fps_is_unpaced() {
        let shared = SharedData::new();
        let frame_loop = FrameLoop::new(None, &shared, SyncPolicy::Loose, Duration::from_secs(1))
            .with_target_fps(0.0);
        assert!(frame_loop.frame_interval.is_none());
        let started = Instant::now();
        frame_loop.run(Some(1000)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_flag_ends_loop() {
        let shared = SharedData::new();
        let frame_loop = FrameLoop::new(None, &shared, SyncPolicy::Loose, Duration::from_secs(1));
        frame_loop.stop_handle().store(true, Ordering::Release);
        assert_eq!(frame_loop.run(None).unwrap(), 0);
    }
}
