//! Bounded connection pool (§4.2). A bidirectional rendez-vous structure
//! that separates "how to make a connection" from "who consumes one".
//!
//! [`ClientPool`] dials out and announces an id in-band; [`ServerPool`]
//! accepts and learns the id the same way. Both share [`PoolCore`] for the
//! idle ledger, the adaptive-capacity manager, and `Flush`/`Close`.

mod client;
mod core;
mod server;

pub use client::ClientPool;
pub use core::{DialFuture, PoolConfig, PoolCore, PoolHandle};
pub use server::ServerPool;

#[cfg(test)]
mod tests {
    use super::*;
    use nodepass_shared::FlowId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> PoolConfig {
        PoolConfig {
            min: 2,
            max: 4,
            interval_min: Duration::from_millis(5),
            interval_max: Duration::from_millis(20),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_and_server_pool_agree_on_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();

        let server_pool = ServerPool::new(Arc::new(listener), test_config());

        let dial = Arc::new(move || {
            let fut = TcpStream::connect(remote_addr);
            Box::pin(async move { fut.await }) as core::DialFuture
        });
        let client_pool = ClientPool::new(dial, test_config());

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(client_pool.ready());
        assert!(server_pool.ready());

        let id = client_pool.peek_any_id().expect("client pool should have entries");
        let client_conn = client_pool.get(&id);
        assert!(client_conn.is_some());

        // The server should have registered a pool entry under the same id
        // because the client announces it during the handshake.
        let mut found = false;
        for _ in 0..20 {
            if let Some((server_id, _conn)) = server_pool.try_get() {
                if server_id == id {
                    found = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found, "server pool never registered an entry for {id}");

        client_pool.close().await;
        server_pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_never_returns_the_same_entry_twice() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let server_pool = ServerPool::new(Arc::new(listener), test_config());
        let dial = Arc::new(move || {
            let fut = TcpStream::connect(remote_addr);
            Box::pin(async move { fut.await }) as core::DialFuture
        });
        let client_pool = ClientPool::new(dial, test_config());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let id = client_pool.peek_any_id().unwrap();
        assert!(client_pool.get(&id).is_some());
        assert!(client_pool.get(&id).is_none());

        client_pool.close().await;
        server_pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_drops_idle_entries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let server_pool = ServerPool::new(Arc::new(listener), test_config());
        let dial = Arc::new(move || {
            let fut = TcpStream::connect(remote_addr);
            Box::pin(async move { fut.await }) as core::DialFuture
        });
        let client_pool = ClientPool::new(dial, test_config());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client_pool.active() > 0);

        client_pool.flush().await;
        assert_eq!(client_pool.active(), 0);

        client_pool.close().await;
        server_pool.close().await;
    }

    #[test]
    fn flow_id_roundtrips_through_hex() {
        let id = FlowId::generate();
        assert_eq!(id.as_str().len(), 8);
    }
}
