//! TCP duplex exchange (§4.3). Concurrently copies both directions of a
//! pair of byte streams until both sides have reached EOF, reporting the
//! byte counts observed in each direction.

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};

/// Byte counts for a completed exchange: `(a_to_b, b_to_a)`.
pub type ExchangeResult = (u64, u64, Option<io::Error>);

/// Copies `a -> b` and `b -> a` concurrently until both directions have
/// seen EOF (or one fails). End-of-stream is not itself an error; only a
/// genuine read/write failure is reported, and only the first one seen.
/// Callers own both `a` and `b` and are responsible for closing them.
pub async fn duplex<A, B>(a: &mut A, b: &mut B) -> ExchangeResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let result = io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        result
    };
    let b_to_a = async {
        let result = io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        result
    };

    let (a_to_b_result, b_to_a_result) = tokio::join!(a_to_b, b_to_a);

    let a_to_b_bytes = a_to_b_result.as_ref().copied().unwrap_or(0);
    let b_to_a_bytes = b_to_a_result.as_ref().copied().unwrap_or(0);
    let first_error = a_to_b_result.err().or_else(|| b_to_a_result.err());

    (a_to_b_bytes, b_to_a_bytes, first_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test(flavor = "multi_thread")]
    async fn echoes_and_counts_bytes_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let echo_task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                sock.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();

        let mut response = [0u8; 6];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"hello\n");

        drop(client);
        echo_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplex_reports_exact_byte_counts_on_close() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        // `a` plays the target connection: sends 5 bytes, then closes.
        let a_task = tokio::spawn(async move {
            let (mut sock, _) = listener_a.accept().await.unwrap();
            sock.write_all(b"world").await.unwrap();
            sock.shutdown().await.unwrap();
        });
        // `b` plays the data connection: sends 3 bytes, then closes.
        let b_task = tokio::spawn(async move {
            let (mut sock, _) = listener_b.accept().await.unwrap();
            sock.write_all(b"abc").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let mut a = TcpStream::connect(addr_a).await.unwrap();
        let mut b = TcpStream::connect(addr_b).await.unwrap();

        let (a_to_b, b_to_a, err) = duplex(&mut a, &mut b).await;
        assert!(err.is_none(), "unexpected error: {err:?}");
        assert_eq!(a_to_b, 5);
        assert_eq!(b_to_a, 3);

        a_task.await.unwrap();
        b_task.await.unwrap();
    }
}
