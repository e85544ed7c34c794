//! Server runtime (§4.6): owns the ingress listeners, issues launch
//! signals, and pairs pool connections with target arrivals.
//!
//! ```text
//! Init ──Start──▶ Listening ──Handshake──▶ Active
//!                                  │             │
//!                                  │             ├── target-arrival → signal+pair
//!                                  │             ├── report tick    → keepalive
//!                                  │             └── error/ctx-done → Stopping
//!                                  └── listener-fail ─────────────▶ Stopping
//! Stopping ──drain──▶ Stopped
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nodepass_pool::{PoolConfig, PoolHandle, ServerPool};
use nodepass_shared::{Protocol, ShutdownTimeout, TunnelConfig, TunnelError};
use rand::Rng;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::control::{encode_flush, encode_handshake, encode_keepalive, encode_launch, ControlWriter};
use crate::{exchange, udp, BoxedControlStream, Stats};

type Writer = Arc<ControlWriter<WriteHalf<BoxedControlStream>>>;

/// §3: "random in `[1024, 8192]`, bound to tunnel's host".
const REMOTE_PORT_MIN: u16 = 1024;
const REMOTE_PORT_MAX: u16 = 8192;
const REMOTE_PORT_BIND_ATTEMPTS: u32 = 64;

/// Picks a random port in `[REMOTE_PORT_MIN, REMOTE_PORT_MAX]` bound to
/// `host`, retrying on collision until one binds or attempts are exhausted.
fn bind_remote_listener(host: std::net::IpAddr) -> io::Result<TcpListener> {
    let mut rng = rand::thread_rng();
    for _ in 0..REMOTE_PORT_BIND_ATTEMPTS {
        let port = rng.gen_range(REMOTE_PORT_MIN..=REMOTE_PORT_MAX);
        let candidate = SocketAddr::new(host, port);
        let socket = socket_factory::tcp(&candidate)?;
        if socket.bind(candidate).is_ok() {
            return socket.listen(1024);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in [{REMOTE_PORT_MIN}, {REMOTE_PORT_MAX}] after {REMOTE_PORT_BIND_ATTEMPTS} attempts"),
    ))
}

/// A fresh `ServerRuntime` is constructed per `Start` attempt (§4.6 "create
/// a fresh context"); the supervisor builds a new one each restart.
pub struct ServerRuntime {
    config: Arc<TunnelConfig>,
    tunnel_addr: SocketAddr,
    stats: Arc<Stats>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ServerRuntime {
    pub fn new(config: Arc<TunnelConfig>, tunnel_addr: SocketAddr, stats: Arc<Stats>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Self { config, tunnel_addr, stats, cancel_tx, cancel_rx, done_tx, done_rx }
    }

    /// Binds every listener, performs the handshake, then services target
    /// arrivals until cancelled or the data listener fails fatally.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let result = self.run().await;
        let _ = self.done_tx.send(true);
        result
    }

    /// Flips the cancellation flag observed at every loop head.
    pub fn stop(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// `Stop` in a task, racing completion against `deadline` (§4.6).
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
        let tls = nodepass_shared::tls::server_tls_config(
            self.config.tls_mode,
            self.config.tls_cert_path.as_deref(),
            self.config.tls_key_path.as_deref(),
            self.config.cert_reload_interval,
        )
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

        let control_socket = socket_factory::tcp(&self.tunnel_addr).map_err(TunnelError::Io)?;
        control_socket.bind(self.tunnel_addr).map_err(TunnelError::Io)?;
        let control_listener = control_socket.listen(1024).map_err(TunnelError::Io)?;

        let remote_listener = Arc::new(bind_remote_listener(self.tunnel_addr.ip()).map_err(TunnelError::Io)?);
        let remote_port = remote_listener.local_addr().map_err(TunnelError::Io)?.port();

        let target_tcp_addr = self.config.resolve_target_tcp().await.map_err(TunnelError::Io)?;
        let target_udp_addr = self.config.resolve_target_udp().await.map_err(TunnelError::Io)?;

        let target_tcp_socket = socket_factory::tcp(&target_tcp_addr).map_err(TunnelError::Io)?;
        target_tcp_socket.bind(target_tcp_addr).map_err(TunnelError::Io)?;
        let target_tcp_listener = target_tcp_socket.listen(1024).map_err(TunnelError::Io)?;
        let target_udp_socket = Arc::new(UdpSocket::bind(target_udp_addr).await.map_err(TunnelError::Io)?);

        info!(tunnel_addr = %self.tunnel_addr, remote_port, "listening");

        let (mut control_conn, peer_addr) = control_listener.accept().await.map_err(TunnelError::Io)?;
        info!(%peer_addr, "accepted control connection");

        // The handshake line itself always goes out in plaintext, on the
        // raw socket: the client must read and parse it before it knows
        // whether to negotiate TLS at all (§3 "the client adopts the mode
        // advertised in the handshake"). Only traffic after this line rides
        // the upgraded channel.
        {
            use tokio::io::AsyncWriteExt;
            control_conn
                .write_all(encode_handshake(remote_port, self.config.tls_mode).as_bytes())
                .await
                .map_err(TunnelError::Io)?;
        }

        let boxed: BoxedControlStream = match tls {
            None => Box::new(control_conn),
            Some((tls_config, _reload_handle)) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                Box::new(
                    acceptor
                        .accept(control_conn)
                        .await
                        .map_err(|e| TunnelError::Handshake(e.to_string()))?,
                )
            }
        };

        // The server is the sole writer on the control channel from here
        // on; it never reads anything back, so only the write half is kept.
        let (_read_half, write_half) = tokio::io::split(boxed);
        let writer: Writer = Arc::new(ControlWriter::new(write_half));

        let pool_cfg = PoolConfig {
            min: self.config.pool_min,
            max: self.config.pool_max,
            interval_min: self.config.pool_interval_min,
            interval_max: self.config.pool_interval_max,
        };
        let pool = Arc::new(ServerPool::new(remote_listener, pool_cfg));
        let semaphore = Arc::new(Semaphore::new(self.config.semaphore_limit));
        let mut report_tick = tokio::time::interval(self.config.report_interval);
        let mut udp_buf = vec![0u8; self.config.udp_buf];
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
                _ = pool.wait_fatal() => {
                    warn!("remote data listener failed fatally, stopping");
                    break;
                }
                _ = report_tick.tick() => {
                    if let Err(e) = writer.write_line(&encode_keepalive()).await {
                        warn!(error = %e, "keepalive write failed, tunnel considered dead");
                        break;
                    }
                }
                accepted = target_tcp_listener.accept() => {
                    match accepted {
                        Ok((conn, addr)) => {
                            if *cancel_rx.borrow() {
                                drop(conn); // tie-break (iii): arrivals during Stopping are closed immediately.
                                continue;
                            }
                            tokio::spawn(handle_tcp_arrival(
                                conn,
                                addr,
                                semaphore.clone(),
                                pool.clone(),
                                writer.clone(),
                                self.stats.clone(),
                            ));
                        }
                        Err(e) => warn!(error = %e, "accept error on target TCP listener"),
                    }
                }
                received = target_udp_socket.recv_from(&mut udp_buf) => {
                    match received {
                        Ok((n, from)) => {
                            let datagram = udp_buf[..n].to_vec();
                            tokio::spawn(handle_udp_arrival(
                                target_udp_socket.clone(),
                                datagram,
                                from,
                                pool.clone(),
                                writer.clone(),
                                self.stats.clone(),
                                self.config.udp_buf,
                                self.config.udp_read_timeout,
                            ));
                        }
                        Err(e) => warn!(error = %e, "read error on target UDP socket"),
                    }
                }
            }
        }

        pool.close().await;
        Ok(())
    }
}

/// Mirrors the client's own threshold check (`client::handle_launch`), but
/// since the server owns the control channel it also notifies the client to
/// flush its pool in lockstep (§4.5/§6, the optional `//#0` signal).
async fn flush_if_depleted(pool: &Arc<ServerPool>, writer: &Writer) {
    if !pool.core().consecutive_failures_exceed_third() {
        return;
    }
    warn!("server-side pool misses exceeded one third of capacity, flushing pool and signaling client");
    pool.flush().await;
    if let Err(e) = writer.write_line(&encode_flush()).await {
        warn!(error = %e, "control channel write failed while signaling flush");
    }
}

async fn handle_tcp_arrival(
    mut target_conn: TcpStream,
    addr: SocketAddr,
    semaphore: Arc<Semaphore>,
    pool: Arc<ServerPool>,
    writer: Writer,
    stats: Arc<Stats>,
) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };

    let Some((id, mut data_conn)) = pool.try_get() else {
        pool.core().record_attempt(false);
        flush_if_depleted(&pool, &writer).await;
        debug!(%addr, "pool empty, dropping target arrival"); // tie-break (i)
        return;
    };
    pool.core().record_attempt(true);

    if let Err(e) = writer.write_line(&encode_launch(&id, Protocol::Tcp)).await {
        warn!(error = %e, %id, "control channel write failed, dropping flow"); // tie-break (ii)
        return;
    }

    let (target_to_data, data_to_target, err) = exchange::duplex(&mut target_conn, &mut data_conn).await;
    if let Some(e) = err {
        debug!(%id, error = %e, "TCP flow ended with error");
    }
    stats.record_tcp_flow(data_to_target, target_to_data);
}

async fn handle_udp_arrival(
    target_udp_socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    from: SocketAddr,
    pool: Arc<ServerPool>,
    writer: Writer,
    stats: Arc<Stats>,
    buf_size: usize,
    read_timeout: Duration,
) {
    let Some((id, mut data_conn)) = pool.try_get() else {
        pool.core().record_attempt(false);
        flush_if_depleted(&pool, &writer).await;
        debug!(%from, "pool empty, dropping UDP arrival");
        return;
    };
    pool.core().record_attempt(true);

    if let Err(e) = writer.write_line(&encode_launch(&id, Protocol::Udp)).await {
        warn!(error = %e, %id, "control channel write failed, dropping UDP flow");
        return;
    }

    match udp::relay_server_side(&target_udp_socket, &mut data_conn, &datagram, from, buf_size, read_timeout).await {
        Ok((bytes_tx, bytes_rx)) => stats.record_udp_flow(bytes_rx, bytes_tx),
        Err(e) => debug!(%id, error = %e, "UDP relay ended with error"),
    }
}
