//! Separates "how to make a connection" from "who consumes one" (§9 design
//! notes, "cyclic references"). The pool and the control-channel dialer are
//! parameterized by a factory rather than hard-coding `TcpStream::connect`,
//! so tests can inject fakes and production code can inject real sockets
//! with platform tuning (`SO_REUSEADDR`) applied uniformly.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, UdpSocket};

/// A factory is any `Fn` that knows how to produce an unconnected/unbound
/// socket for a given peer address. Kept as a plain function-pointer alias
/// rather than a trait object generic over a marker trait, since unlike the
/// teacher's WebSocket-only use case we need this for both TCP and UDP.
pub type TcpFactory = std::sync::Arc<dyn Fn(&SocketAddr) -> io::Result<TcpSocket> + Send + Sync>;
pub type UdpFactory = std::sync::Arc<dyn Fn(&SocketAddr) -> io::Result<UdpSocket> + Send + Sync>;

/// Default TCP factory: a fresh, unconnected socket with `SO_REUSEADDR` set,
/// matching the teacher's dial-socket construction.
pub fn tcp(addr: &SocketAddr) -> io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    TcpSocket::from_std_stream(socket.into())
}

/// Default UDP factory: a bound, unconnected datagram socket on an
/// OS-assigned ephemeral port of the same address family as `addr`.
pub async fn udp(addr: &SocketAddr) -> io::Result<UdpSocket> {
    let any = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    UdpSocket::bind(any).await
}

pub fn default_tcp_factory() -> TcpFactory {
    std::sync::Arc::new(tcp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_factory_produces_usable_socket() {
        let factory = default_tcp_factory();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = factory(&addr).expect("factory should succeed");
        assert!(socket.local_addr().is_ok());
    }

    #[tokio::test]
    async fn udp_factory_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = udp(&addr).await.expect("bind should succeed");
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
