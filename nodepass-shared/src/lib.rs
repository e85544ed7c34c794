pub mod config;
pub mod error;
pub mod flow;
pub mod tls;

pub use config::{LogLevel, Mode, TlsMode, TunnelConfig};
pub use error::{ConfigError, ProtocolError, ShutdownTimeout, TunnelError};
pub use flow::{FlowId, Protocol};

/// The machine-readable token every flow completion logs (§6).
pub fn traffic_stats_line(tcp_rx: u64, tcp_tx: u64, udp_rx: u64, udp_tx: u64) -> String {
    format!("TRAFFIC_STATS|TCP_RX={tcp_rx}|TCP_TX={tcp_tx}|UDP_RX={udp_rx}|UDP_TX={udp_tx}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_stats_line_format() {
        assert_eq!(
            traffic_stats_line(6, 6, 0, 0),
            "TRAFFIC_STATS|TCP_RX=6|TCP_TX=6|UDP_RX=0|UDP_TX=0"
        );
    }
}
