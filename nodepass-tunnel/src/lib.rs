//! Control-channel protocol, TCP/UDP data-plane relays, and the server and
//! client runtime state machines (§4.3-§4.7).

pub mod client;
pub mod control;
pub mod exchange;
pub mod server;
pub mod udp;

use std::sync::atomic::{AtomicU64, Ordering};

use nodepass_shared::traffic_stats_line;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

pub use client::ClientRuntime;
pub use server::ServerRuntime;

/// Any duplex byte stream the control channel can ride on, whether plain
/// TCP or a TLS-wrapped socket. Boxing lets `ServerRuntime`/`ClientRuntime`
/// stay TLS-mode-agnostic past the handshake.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type BoxedControlStream = Box<dyn AsyncDuplex>;

/// Monotonic, process-lifetime traffic counters (§5 "Statistics are
/// monotonic per instance"). Shared across every flow handler.
#[derive(Default)]
pub struct Stats {
    tcp_rx: AtomicU64,
    tcp_tx: AtomicU64,
    udp_rx: AtomicU64,
    udp_tx: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.tcp_rx.load(Ordering::Relaxed),
            self.tcp_tx.load(Ordering::Relaxed),
            self.udp_rx.load(Ordering::Relaxed),
            self.udp_tx.load(Ordering::Relaxed),
        )
    }

    /// Records a completed TCP flow and emits its `TRAFFIC_STATS` line
    /// (§6, §8 invariant 7: the emitted integers match the exchange's own
    /// byte counts).
    fn record_tcp_flow(&self, bytes_rx: u64, bytes_tx: u64) {
        self.tcp_rx.fetch_add(bytes_rx, Ordering::Relaxed);
        self.tcp_tx.fetch_add(bytes_tx, Ordering::Relaxed);
        info!("{}", traffic_stats_line(bytes_rx, bytes_tx, 0, 0));
    }

    /// Same as [`Stats::record_tcp_flow`] for a completed UDP relay.
    fn record_udp_flow(&self, bytes_rx: u64, bytes_tx: u64) {
        self.udp_rx.fetch_add(bytes_rx, Ordering::Relaxed);
        self.udp_tx.fetch_add(bytes_tx, Ordering::Relaxed);
        info!("{}", traffic_stats_line(0, 0, bytes_rx, bytes_tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_across_flows() {
        let stats = Stats::default();
        stats.record_tcp_flow(6, 6);
        stats.record_tcp_flow(4, 2);
        assert_eq!(stats.snapshot(), (10, 8, 0, 0));
    }
}
