//! The master-mode boundary (§6, §9): this core exposes only what an
//! external master collaborator needs — spawning child processes of the
//! same binary, reading their `TRAFFIC_STATS` tokens off stdout, and
//! forwarding shutdown signals. The REST/SSE/OpenAPI surface and the
//! persistent atomic state file belong to that external collaborator and
//! are not implemented here.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Cumulative traffic counters parsed off a child's `TRAFFIC_STATS` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceStats {
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub udp_rx: u64,
    pub udp_tx: u64,
}

impl InstanceStats {
    /// Parses one `TRAFFIC_STATS|TCP_RX=..|TCP_TX=..|UDP_RX=..|UDP_TX=..`
    /// line and folds it into the running totals. Malformed lines (any
    /// field missing or unparseable) are ignored, matching the tunnel's
    /// own tolerance of malformed control-channel lines.
    fn absorb_line(&mut self, line: &str) {
        let Some(rest) = line.strip_prefix("TRAFFIC_STATS|") else { return };
        let mut tcp_rx = None;
        let mut tcp_tx = None;
        let mut udp_rx = None;
        let mut udp_tx = None;
        for field in rest.split('|') {
            let Some((key, value)) = field.split_once('=') else { continue };
            let Ok(value) = value.trim().parse::<u64>() else { continue };
            match key {
                "TCP_RX" => tcp_rx = Some(value),
                "TCP_TX" => tcp_tx = Some(value),
                "UDP_RX" => udp_rx = Some(value),
                "UDP_TX" => udp_tx = Some(value),
                _ => {}
            }
        }
        if let (Some(rx), Some(tx), Some(urx), Some(utx)) = (tcp_rx, tcp_tx, udp_rx, udp_tx) {
            self.tcp_rx = self.tcp_rx.saturating_add(rx);
            self.tcp_tx = self.tcp_tx.saturating_add(tx);
            self.udp_rx = self.udp_rx.saturating_add(urx);
            self.udp_tx = self.udp_tx.saturating_add(utx);
        }
    }
}

/// One supervised child process, spawned with a client/server URL argument
/// identical to what a standalone invocation of the binary would take.
pub struct ChildInstance {
    pub id: String,
    child: Child,
    stats: Arc<Mutex<InstanceStats>>,
}

impl ChildInstance {
    pub fn stats_handle(&self) -> Arc<Mutex<InstanceStats>> {
        self.stats.clone()
    }

    /// Forwards a termination request to the child (§6 "SIGTERM/SIGINT
    /// shutdown contract"). Unix-only, matching the process model this
    /// binary targets.
    pub fn terminate(&self) {
        if let Some(pid) = self.child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!(instance = %self.id, error = %e, "failed to signal child");
            }
        }
    }

    pub async fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Spawns `binary_path <instance_url>`, wiring stdout/stderr into a reader
/// task that accumulates `TRAFFIC_STATS` tokens onto the returned handle.
pub fn spawn_instance(id: String, binary_path: &str, instance_url: &str) -> std::io::Result<ChildInstance> {
    let mut child = Command::new(binary_path)
        .arg(instance_url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stats = Arc::new(Mutex::new(InstanceStats::default()));

    if let Some(stdout) = child.stdout.take() {
        let stats = stats.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.contains("TRAFFIC_STATS") {
                            stats.lock().await.absorb_line(line.trim());
                        } else {
                            debug!(instance = %id, "{line}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(instance = %id, error = %e, "stdout reader error");
                        break;
                    }
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(instance = %id, "{line}");
            }
        });
    }

    info!(instance = %id, binary = %binary_path, "spawned child instance");
    Ok(ChildInstance { id, child, stats })
}

/// An in-memory sync map of running child instances, keyed by instance id.
/// The persistent atomic state file and REST surface a real master would
/// layer on top of this are out of scope (§6, §9).
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, ChildInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: ChildInstance) {
        self.instances.lock().await.insert(instance.id.clone(), instance);
    }

    pub async fn remove(&self, id: &str) -> Option<ChildInstance> {
        self.instances.lock().await.remove(id)
    }

    pub async fn terminate_all(&self) {
        let mut instances = self.instances.lock().await;
        for instance in instances.values() {
            instance.terminate();
        }
        instances.clear();
    }

    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorbs_well_formed_stats_line() {
        let mut stats = InstanceStats::default();
        stats.absorb_line("TRAFFIC_STATS|TCP_RX=10|TCP_TX=20|UDP_RX=1|UDP_TX=2");
        assert_eq!(stats.tcp_rx, 10);
        assert_eq!(stats.tcp_tx, 20);
        assert_eq!(stats.udp_rx, 1);
        assert_eq!(stats.udp_tx, 2);
    }

    #[test]
    fn accumulates_across_multiple_lines() {
        let mut stats = InstanceStats::default();
        stats.absorb_line("TRAFFIC_STATS|TCP_RX=10|TCP_TX=20|UDP_RX=1|UDP_TX=2");
        stats.absorb_line("TRAFFIC_STATS|TCP_RX=5|TCP_TX=5|UDP_RX=0|UDP_TX=0");
        assert_eq!(stats.tcp_rx, 15);
        assert_eq!(stats.tcp_tx, 25);
    }

    #[test]
    fn ignores_malformed_or_unrelated_lines() {
        let mut stats = InstanceStats::default();
        stats.absorb_line("some unrelated log line");
        stats.absorb_line("TRAFFIC_STATS|TCP_RX=oops|TCP_TX=20|UDP_RX=1|UDP_TX=2");
        assert_eq!(stats.tcp_rx, 0);
        assert_eq!(stats.tcp_tx, 0);
    }

    #[tokio::test]
    async fn registry_tracks_insert_and_remove() {
        let registry = InstanceRegistry::new();
        assert_eq!(registry.len().await, 0);
    }
}
