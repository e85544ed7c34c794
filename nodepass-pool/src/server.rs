use std::sync::Arc;

use nodepass_shared::FlowId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::{PoolConfig, PoolCore, PoolHandle};

/// Accepts connections from the remote data listener, assigns each an id
/// via the in-band handshake, and publishes them for [`ServerPool::try_get`]
/// (§4.2).
pub struct ServerPool {
    core: Arc<PoolCore>,
    acceptor: tokio::task::JoinHandle<()>,
    manager: tokio::task::JoinHandle<()>,
    fatal_rx: watch::Receiver<bool>,
}

impl ServerPool {
    pub fn new(listener: Arc<TcpListener>, cfg: PoolConfig) -> Self {
        let core = PoolCore::new(cfg);
        let manager = core.spawn_manager();
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let acceptor = spawn_acceptor(core.clone(), listener, fatal_tx);

        Self {
            core,
            acceptor,
            manager,
            fatal_rx,
        }
    }

    /// `ServerGet()`: pops the next available `(id, conn)`, or `None` if the
    /// pool is empty (§4.2, §4.6 tie-break (i)).
    pub fn try_get(&self) -> Option<(FlowId, TcpStream)> {
        self.core.pop_next()
    }

    pub async fn flush(&self) {
        self.core.flush();
    }

    pub async fn close(&self) {
        self.core.close();
        self.acceptor.abort();
        self.manager.abort();
    }

    /// Resolves once the remote data listener has hit a fatal, unrecoverable
    /// error. The runtime observes this to transition into Stopping
    /// (§4.2 "Failures": "fatal listener errors propagate to the runtime").
    pub async fn wait_fatal(&self) {
        let mut rx = self.fatal_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl PoolHandle for ServerPool {
    fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }
}

const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 10;

fn spawn_acceptor(
    core: Arc<PoolCore>,
    listener: Arc<TcpListener>,
    fatal_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut consecutive_errors = 0u32;
        loop {
            if core.is_closed() {
                return;
            }

            match listener.accept().await {
                Ok((conn, addr)) => {
                    consecutive_errors = 0;
                    let core = core.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handshake_and_insert(core, conn).await {
                            warn!(%addr, error = %e, "data connection handshake failed");
                        }
                    });
                }
                Err(e) => {
                    consecutive_errors += 1;
                    core.record_attempt(false);
                    warn!(error = %e, consecutive_errors, "accept error on remote data listener");
                    if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        let _ = fatal_tx.send(true);
                        return;
                    }
                }
            }
        }
    })
}

async fn handshake_and_insert(core: Arc<PoolCore>, conn: TcpStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(conn);
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line).await {
        core.record_attempt(false);
        return Err(e);
    }
    let id = FlowId::from(line.trim().to_string());
    core.record_attempt(true);

    let conn = reader.into_inner();
    if core.try_insert(id.clone(), conn) {
        debug!(%id, "registered data connection");
    } else {
        debug!(%id, "pool at capacity, dropping freshly accepted connection");
    }
    Ok(())
}
