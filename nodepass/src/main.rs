use anyhow::{bail, Context, Result};
use clap::Parser;
use nodepass_shared::{Mode, TunnelConfig};
use nodepass_supervisor::supervise;
use nodepass_tunnel::{ClientRuntime, ServerRuntime, Stats};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer as _, Registry};

/// `server://host:port/targetHost:port[?query]` | `client://host:port/targetHost:port[?query]`
/// | `master://host:port/apiPrefix[?query]` (§6). Master mode is an external
/// collaborator boundary only — see `nodepass_supervisor::master`.
#[derive(Parser, Debug)]
#[command(name = "nodepass", version, about = "TCP/UDP tunnel bridging network endpoints through a control channel")]
struct Cli {
    url: String,
}

fn main() {
    if let Err(e) = try_main() {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let config = TunnelConfig::from_url(&cli.url).context("failed to parse tunnel URL")?;
    setup_logging(config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: TunnelConfig) -> Result<()> {
    let config = Arc::new(config);
    let tunnel_addr = config
        .resolve_tunnel_address()
        .await
        .context("tunnel address did not resolve")?;

    match config.mode {
        Mode::Server => {
            let service_cooldown = config.service_cooldown;
            let shutdown_timeout = config.shutdown_timeout;
            supervise(
                move || ServerRuntime::new(config.clone(), tunnel_addr, Arc::new(Stats::default())),
                service_cooldown,
                shutdown_timeout,
            )
            .await;
        }
        Mode::Client => {
            let service_cooldown = config.service_cooldown;
            let shutdown_timeout = config.shutdown_timeout;
            supervise(
                move || ClientRuntime::new(config.clone(), tunnel_addr, Arc::new(Stats::default())),
                service_cooldown,
                shutdown_timeout,
            )
            .await;
        }
        Mode::Master => {
            bail!(
                "master mode's REST/SSE control plane is an external collaborator; \
                 this binary exposes only the child-process boundary via nodepass_supervisor::master"
            );
        }
    }

    Ok(())
}

fn setup_logging(level: nodepass_shared::LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter_str().parse().expect("valid level filter"))
        .from_env_lossy();
    let layer = fmt::layer().with_filter(filter);
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber).expect("setting global tracing subscriber");
}
