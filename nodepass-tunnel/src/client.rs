//! Client runtime (§4.7): dials the control channel, maintains the
//! pre-warmed pool, and dispatches each signal to a per-flow handler.
//!
//! ```text
//! Init ──Start──▶ Dialling ──Handshake──▶ Active
//!                                │             │
//!                                │             ├── signal#1 → TCP handler
//!                                │             ├── signal#2 → UDP handler
//!                                │             ├── signal#0 → pool.Flush
//!                                │             └── ctx-done / read-err → Stopping
//! Stopping ──drain──▶ Stopped (supervisor may re-Start)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nodepass_pool::{ClientPool, DialFuture, PoolConfig, PoolHandle};
use nodepass_shared::{FlowId, Protocol, ShutdownTimeout, TlsMode, TunnelConfig, TunnelError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::control::{parse_line, ControlReader, Signal, SignalQueue};
use crate::{udp, BoxedControlStream, Stats};

/// A fresh `ClientRuntime` is constructed per `Start` attempt, mirroring
/// [`crate::server::ServerRuntime`].
pub struct ClientRuntime {
    config: Arc<TunnelConfig>,
    tunnel_addr: SocketAddr,
    stats: Arc<Stats>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ClientRuntime {
    pub fn new(config: Arc<TunnelConfig>, tunnel_addr: SocketAddr, stats: Arc<Stats>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Self { config, tunnel_addr, stats, cancel_tx, cancel_rx, done_tx, done_rx }
    }

    pub async fn start(&self) -> Result<(), TunnelError> {
        let result = self.run().await;
        let _ = self.done_tx.send(true);
        result
    }

    pub fn stop(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownTimeout> {
        self.stop();
        let mut done_rx = self.done_rx.clone();
        let wait_done = async {
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait_done).await.map_err(|_| ShutdownTimeout)
    }

    async fn run(&self) -> Result<(), TunnelError> {
        let raw = TcpStream::connect(self.tunnel_addr).await.map_err(TunnelError::Io)?;
        let mut plain_reader = BufReader::new(raw);
        let mut line = String::new();
        plain_reader.read_line(&mut line).await.map_err(TunnelError::Io)?;
        let (remote_port, tls_mode) = match parse_line(&line).map_err(|e| TunnelError::Handshake(e.to_string()))? {
            Signal::Handshake { remote_port, tls_mode } => (remote_port, tls_mode),
            _ => return Err(TunnelError::Handshake("expected a handshake line first".into())),
        };
        info!(remote_port, tls_mode = tls_mode.code(), "handshake received, tls mode adopted");

        let raw = plain_reader.into_inner();
        let boxed = upgrade_to_tls_if_needed(raw, tls_mode).await?;

        let (read_half, _write_half) = tokio::io::split(boxed);
        let mut control_reader = ControlReader::new(read_half);

        let remote_addr = SocketAddr::new(self.tunnel_addr.ip(), remote_port);
        let pool_cfg = PoolConfig {
            min: self.config.pool_min,
            max: self.config.pool_max,
            interval_min: self.config.pool_interval_min,
            interval_max: self.config.pool_interval_max,
        };
        let dial: Arc<dyn Fn() -> DialFuture + Send + Sync> = Arc::new(move || {
            let addr = remote_addr;
            Box::pin(async move { TcpStream::connect(addr).await }) as DialFuture
        });
        let pool = Arc::new(ClientPool::new(dial, pool_cfg));

        let queue = SignalQueue::new(self.config.semaphore_limit);
        let mut reader_task = {
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    match control_reader.next_signal().await {
                        Ok(Some(signal)) => queue.push(signal).await,
                        Ok(None) => {
                            warn!("control channel closed by peer");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "control channel read error");
                            return;
                        }
                    }
                }
            })
        };

        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            if *cancel_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = &mut reader_task => {
                    warn!("control channel reader exited, tunnel considered dead");
                    break;
                }
                signal = queue.pop() => {
                    match signal {
                        Signal::Keepalive => debug!("keepalive received"),
                        Signal::Handshake { .. } => warn!("unexpected repeated handshake line, ignoring"),
                        Signal::Flush => {
                            debug!("flush signal received");
                            pool.flush().await;
                        }
                        Signal::Launch { id, protocol } => {
                            tokio::spawn(handle_launch(
                                id,
                                protocol,
                                pool.clone(),
                                self.config.clone(),
                                self.stats.clone(),
                            ));
                        }
                    }
                }
            }
        }

        reader_task.abort();
        pool.close().await;
        Ok(())
    }
}

async fn upgrade_to_tls_if_needed(
    raw: TcpStream,
    tls_mode: TlsMode,
) -> Result<BoxedControlStream, TunnelError> {
    match tls_mode {
        TlsMode::Plain => Ok(Box::new(raw)),
        TlsMode::SelfSigned | TlsMode::FileBacked => {
            let connector = tokio_rustls::TlsConnector::from(nodepass_shared::tls::client_tls_config());
            let server_name = rustls::pki_types::ServerName::try_from("nodepass.local")
                .map_err(|e| TunnelError::Handshake(e.to_string()))?
                .to_owned();
            let tls_stream = connector
                .connect(server_name, raw)
                .await
                .map_err(|e| TunnelError::Handshake(e.to_string()))?;
            Ok(Box::new(tls_stream))
        }
    }
}

/// §4.7: wait for the pool to be ready, `ClientGet(id)`, and either run the
/// matching exchange or count the miss toward the ⅓-capacity flush trigger.
async fn handle_launch(
    id: FlowId,
    protocol: Protocol,
    pool: Arc<ClientPool>,
    config: Arc<TunnelConfig>,
    stats: Arc<Stats>,
) {
    while !pool.ready() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let Some(mut data_conn) = pool.get(&id) else {
        pool.core().record_attempt(false);
        if pool.core().consecutive_failures_exceed_third() {
            warn!("client-side pool misses exceeded one third of capacity, flushing pool");
            pool.flush().await;
        }
        debug!(%id, "no pool entry for launch signal, dropping flow");
        return;
    };
    pool.core().record_attempt(true);

    match protocol {
        Protocol::Tcp => {
            let Ok(target_addr) = config.resolve_target_tcp().await else {
                debug!(%id, "target TCP address did not resolve, dropping flow");
                return;
            };
            let Ok(Ok(mut target_conn)) =
                tokio::time::timeout(config.tcp_dial_timeout, TcpStream::connect(target_addr)).await
            else {
                debug!(%id, %target_addr, "failed to dial local TCP target");
                return;
            };
            let (target_to_data, data_to_target, err) =
                crate::exchange::duplex(&mut target_conn, &mut data_conn).await;
            if let Some(e) = err {
                debug!(%id, error = %e, "TCP flow ended with error");
            }
            stats.record_tcp_flow(data_to_target, target_to_data);
        }
        Protocol::Udp => {
            let Ok(target_addr) = config.resolve_target_udp().await else {
                debug!(%id, "target UDP address did not resolve, dropping flow");
                return;
            };
            match udp::relay_client_side(
                &mut data_conn,
                target_addr,
                config.udp_buf,
                config.udp_dial_timeout,
                config.udp_read_timeout,
            )
            .await
            {
                Ok((bytes_tx, bytes_rx)) => stats.record_udp_flow(bytes_rx, bytes_tx),
                Err(e) => debug!(%id, error = %e, "UDP relay ended with error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_is_noop_for_plain_mode() {
        // Covered end-to-end in `tests/` via a real loopback handshake;
        // this just documents that `Plain` never touches TLS machinery.
        assert_eq!(TlsMode::Plain.code(), "0");
    }
}
