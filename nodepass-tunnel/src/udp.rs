//! UDP datagram relay (§4.4). Each relay carries exactly one request/response
//! pair; no session state survives past the pair.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// `(bytes_to_peer, bytes_from_peer)`, mirroring the TCP exchange's
/// direction-tagged counters so both feed the same `TRAFFIC_STATS` shape.
pub type RelayResult = (u64, u64);

/// Server path (§4.4): a datagram already read from the target socket is
/// forwarded over `data_conn`; the first reply read back within
/// `read_timeout` is written back to `reply_to` on `target_socket`.
pub async fn relay_server_side(
    target_socket: &UdpSocket,
    data_conn: &mut TcpStream,
    datagram: &[u8],
    reply_to: SocketAddr,
    buf_size: usize,
    read_timeout: Duration,
) -> std::io::Result<RelayResult> {
    data_conn.write_all(datagram).await?;
    let bytes_to_peer = datagram.len() as u64;

    let mut buf = vec![0u8; buf_size];
    let read = timeout(read_timeout, data_conn.read(&mut buf)).await??;
    let bytes_from_peer = read as u64;

    if read > 0 {
        target_socket.send_to(&buf[..read], reply_to).await?;
    }

    Ok((bytes_to_peer, bytes_from_peer))
}

/// Client path (§4.4): on a launch signal, read the first datagram off
/// `data_conn`, dial the local UDP target (`dial_timeout`), exchange one
/// request/response pair, and write the reply back onto `data_conn`.
pub async fn relay_client_side(
    data_conn: &mut TcpStream,
    target_addr: SocketAddr,
    buf_size: usize,
    dial_timeout: Duration,
    read_timeout: Duration,
) -> std::io::Result<RelayResult> {
    let mut buf = vec![0u8; buf_size];
    let read = data_conn.read(&mut buf).await?;
    let bytes_from_peer = read as u64;

    let local = if target_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = timeout(dial_timeout, UdpSocket::bind(local)).await??;
    socket.connect(target_addr).await?;
    socket.send(&buf[..read]).await?;

    let mut reply = vec![0u8; buf_size];
    let reply_len = timeout(read_timeout, socket.recv(&mut reply)).await??;
    let bytes_to_peer = reply_len as u64;

    if reply_len > 0 {
        data_conn.write_all(&reply[..reply_len]).await?;
    }

    Ok((bytes_to_peer, bytes_from_peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread")]
    async fn client_side_relay_round_trips_through_local_target() {
        // Local UDP target: echoes [0xAA] for any incoming datagram (S2).
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let target_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, peer) = target.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
            target.send_to(&[0xAA], peer).await.unwrap();
        });

        // Stand-in data connection: a loopback TCP pair carrying the
        // request datagram, then receiving the reply.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer_task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
            let mut reply = [0u8; 1];
            conn.read_exact(&mut reply).await.unwrap();
            reply
        });

        let mut data_conn = TcpStream::connect(addr).await.unwrap();
        let (to_peer, from_peer) = relay_client_side(
            &mut data_conn,
            target_addr,
            2048,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(from_peer, 3);
        assert_eq!(to_peer, 1);

        target_task.await.unwrap();
        let reply = peer_task.await.unwrap();
        assert_eq!(reply, [0xAA]);
    }
}
