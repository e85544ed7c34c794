//! End-to-end tunnel scenarios over real loopback sockets (§8 S1, S2, S5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nodepass_shared::{LogLevel, Mode, TlsMode, TunnelConfig};
use nodepass_tunnel::{ClientRuntime, ServerRuntime, Stats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn test_config(mode: Mode, tunnel_address: SocketAddr, target_address: SocketAddr) -> Arc<TunnelConfig> {
    Arc::new(TunnelConfig {
        mode,
        tunnel_address: tunnel_address.to_string(),
        target_address: target_address.to_string(),
        tls_mode: TlsMode::Plain,
        tls_cert_path: None,
        tls_key_path: None,
        log_level: LogLevel::Info,
        pool_min: 2,
        pool_max: 4,
        semaphore_limit: 64,
        udp_buf: 2048,
        udp_read_timeout: Duration::from_secs(2),
        udp_dial_timeout: Duration::from_secs(2),
        tcp_dial_timeout: Duration::from_secs(2),
        tcp_read_timeout: Duration::from_secs(0),
        pool_interval_min: Duration::from_millis(20),
        pool_interval_max: Duration::from_millis(100),
        report_interval: Duration::from_millis(200),
        service_cooldown: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(2),
        cert_reload_interval: Duration::from_secs(3600),
    })
}

struct Tunnel {
    server: Arc<ServerRuntime>,
    client: Arc<ClientRuntime>,
    server_handle: tokio::task::JoinHandle<Result<(), nodepass_shared::TunnelError>>,
    client_handle: tokio::task::JoinHandle<Result<(), nodepass_shared::TunnelError>>,
}

impl Tunnel {
    async fn start(server_target: SocketAddr, client_target: SocketAddr) -> (Self, Arc<Stats>, Arc<Stats>) {
        let tunnel_addr = free_addr().await;

        let server_stats = Arc::new(Stats::default());
        let server_cfg = test_config(Mode::Server, tunnel_addr, server_target);
        let server = Arc::new(ServerRuntime::new(server_cfg, tunnel_addr, server_stats.clone()));
        let server_handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client_stats = Arc::new(Stats::default());
        let client_cfg = test_config(Mode::Client, tunnel_addr, client_target);
        let client = Arc::new(ClientRuntime::new(client_cfg, tunnel_addr, client_stats.clone()));
        let client_handle = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };

        // Let the handshake complete and the pool pre-warm (S3).
        tokio::time::sleep(Duration::from_millis(300)).await;

        (
            Self { server, client, server_handle, client_handle },
            server_stats,
            client_stats,
        )
    }

    async fn shutdown(self) {
        let _ = self.client.shutdown(Duration::from_secs(2)).await;
        let _ = self.server.shutdown(Duration::from_secs(2)).await;
        let _ = self.client_handle.await;
        let _ = self.server_handle.await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_local_tcp_echo() {
    let server_target = free_addr().await;
    let client_target = free_addr().await;

    let echo_listener = TcpListener::bind(client_target).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = echo_listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let (tunnel, server_stats, _client_stats) = Tunnel::start(server_target, client_target).await;

    let mut conn = TcpStream::connect(server_target).await.unwrap();
    conn.write_all(b"hello\n").await.unwrap();
    let mut response = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut response))
        .await
        .expect("response within deadline")
        .unwrap();
    assert_eq!(&response, b"hello\n");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let (tcp_rx, tcp_tx, _, _) = server_stats.snapshot();
    assert!(tcp_rx >= 6, "tcp_rx={tcp_rx}");
    assert!(tcp_tx >= 6, "tcp_tx={tcp_tx}");

    tunnel.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_local_udp_roundtrip() {
    let server_target = free_addr().await;
    let client_target = free_addr().await;

    // The "local target": replies 0xAA to whatever it receives.
    let local_target = UdpSocket::bind(client_target).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((n, from)) = local_target.recv_from(&mut buf).await else { return };
            assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
            let _ = local_target.send_to(&[0xAA], from).await;
        }
    });

    let (tunnel, _server_stats, _client_stats) = Tunnel::start(server_target, client_target).await;

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&[0x01, 0x02, 0x03], server_target).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
        .await
        .expect("reply within udpReadTimeout")
        .unwrap();
    assert_eq!(&buf[..n], &[0xAA]);

    tunnel.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_graceful_shutdown_within_deadline() {
    let server_target = free_addr().await;
    let client_target = free_addr().await;

    let echo_listener = TcpListener::bind(client_target).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = echo_listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let (tunnel, _server_stats, _client_stats) = Tunnel::start(server_target, client_target).await;

    let started = std::time::Instant::now();
    tunnel.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3), "shutdown exceeded its deadline budget");
}
