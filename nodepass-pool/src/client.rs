use std::sync::Arc;

use nodepass_shared::FlowId;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::core::{DialFuture, PoolConfig, PoolCore, PoolHandle};

/// Maintains up to `capacity` pre-established data connections dialed back
/// to the server's remote data listener. Each connection announces its id
/// in-band right after connecting so the server-side [`crate::ServerPool`]
/// can agree on the same id (§4.2).
pub struct ClientPool {
    core: Arc<PoolCore>,
    producer: tokio::task::JoinHandle<()>,
    manager: tokio::task::JoinHandle<()>,
}

impl ClientPool {
    pub fn new(dial: Arc<dyn Fn() -> DialFuture + Send + Sync>, cfg: PoolConfig) -> Self {
        let core = PoolCore::new(cfg);
        let manager = core.spawn_manager();
        let producer = spawn_producer(core.clone(), dial);

        Self {
            core,
            producer,
            manager,
        }
    }

    /// `ClientGet(id)`: removes and returns the matching entry, or `None`
    /// if absent (§4.2, §7 PoolDepletion).
    pub fn get(&self, id: &FlowId) -> Option<TcpStream> {
        self.core.get_by_id(id)
    }

    pub fn peek_any_id(&self) -> Option<FlowId> {
        self.core.peek_any_id()
    }

    pub async fn flush(&self) {
        self.core.flush();
    }

    /// `Close()`: flush plus stop producers.
    pub async fn close(&self) {
        self.core.close();
        self.producer.abort();
        self.manager.abort();
    }
}

impl PoolHandle for ClientPool {
    fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }
}

fn spawn_producer(
    core: Arc<PoolCore>,
    dial: Arc<dyn Fn() -> DialFuture + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if core.is_closed() {
                return;
            }

            if core.active() >= core.capacity() {
                tokio::time::sleep(core.next_production_interval()).await;
                continue;
            }

            match dial().await {
                Ok(mut conn) => {
                    let id = FlowId::generate();
                    match conn.write_all(format!("{id}\n").as_bytes()).await {
                        Ok(()) => {
                            core.record_attempt(true);
                            if !core.try_insert(id.clone(), conn) {
                                debug!(%id, "pool at capacity, discarding freshly dialed connection");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to announce id on new data connection");
                            core.record_attempt(false);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to dial data connection");
                    core.record_attempt(false);
                }
            }

            if core.consecutive_failures_exceed_third() {
                warn!("data connection dial failures exceeded one third of capacity, flushing pool");
                core.flush();
            }

            tokio::time::sleep(core.next_production_interval()).await;
        }
    })
}
