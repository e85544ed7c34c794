//! Supervisor (§4.8): start/stop/shutdown lifecycle with cooldown restart
//! and signal-triggered graceful shutdown. Also the master-mode boundary
//! (§6 "master collaborator (out of core)"): spawning child processes of
//! the same binary and parsing their `TRAFFIC_STATS` stdout tokens.

pub mod master;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodepass_shared::{ShutdownTimeout, TunnelError};
use nodepass_tunnel::{ClientRuntime, ServerRuntime};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// The lifecycle surface the supervisor drives. Implemented by
/// [`ServerRuntime`] and [`ClientRuntime`]; kept as a trait so `supervise`
/// doesn't care which side of the tunnel it's running.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn start(&self) -> Result<(), TunnelError>;
    fn stop(&self);
    async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownTimeout>;
}

#[async_trait]
impl Runtime for ServerRuntime {
    async fn start(&self) -> Result<(), TunnelError> {
        ServerRuntime::start(self).await
    }
    fn stop(&self) {
        ServerRuntime::stop(self)
    }
    async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownTimeout> {
        ServerRuntime::shutdown(self, deadline).await
    }
}

#[async_trait]
impl Runtime for ClientRuntime {
    async fn start(&self) -> Result<(), TunnelError> {
        ClientRuntime::start(self).await
    }
    fn stop(&self) {
        ClientRuntime::stop(self)
    }
    async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownTimeout> {
        ClientRuntime::shutdown(self, deadline).await
    }
}

/// Runs `build()` forever: start, and on failure log + cooldown + restart.
/// A SIGINT/SIGTERM observed while a runtime is active cancels the loop via
/// `Shutdown(shutdownTimeout)` and returns (§4.8, §5 "Cancellation &
/// timeouts").
pub async fn supervise<R, F>(build: F, service_cooldown: Duration, shutdown_timeout: Duration)
where
    R: Runtime + 'static,
    F: Fn() -> R,
{
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    loop {
        let runtime = Arc::new(build());

        // `start()` must keep running its own task even if a signal branch
        // wins the select below — otherwise `shutdown` has nothing left to
        // cancel and `done_rx` never fires. Spawn it first and race the
        // `JoinHandle`, mirroring the teacher's `tokio::spawn(run(...)).err_into()`
        // raced against `ctrl_c()` in `gateway/src/main.rs`.
        let mut task = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.start().await })
        };

        let outcome = tokio::select! {
            result = &mut task => Some(result),
            _ = term.recv() => {
                info!("SIGTERM received, shutting down");
                shutdown_and_report(&runtime, shutdown_timeout).await;
                let _ = task.await;
                return;
            }
            _ = int.recv() => {
                info!("SIGINT received, shutting down");
                shutdown_and_report(&runtime, shutdown_timeout).await;
                let _ = task.await;
                return;
            }
        };

        match outcome {
            Some(Ok(Ok(()))) => info!("runtime stopped cleanly"),
            Some(Ok(Err(e))) => warn!(error = %e, "runtime failed, will restart after cooldown"),
            Some(Err(e)) => warn!(error = %e, "runtime task panicked, will restart after cooldown"),
            None => unreachable!("select branch always produces an outcome or returns"),
        }
        runtime.stop();
        tokio::time::sleep(service_cooldown).await;
    }
}

async fn shutdown_and_report<R: Runtime + ?Sized>(runtime: &Arc<R>, deadline: Duration) {
    if runtime.shutdown(deadline).await.is_err() {
        warn!("shutdown did not complete within shutdownTimeout");
    }
}
