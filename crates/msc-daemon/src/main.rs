//! `msc-daemon` binary entry point

use anyhow::Context;
use clap::Parser;
use msc_core::{ConsistencyConfig, ConsistencyService};
use msc_daemon::{build_registry, routes};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multi-store consistency and recovery coordinator
#[derive(Debug, Parser)]
#[command(name = "msc-daemon", version, about)]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, env = "MSC_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the operational HTTP interface
    #[arg(short, long, env = "MSC_BIND", default_value = "127.0.0.1:7878")]
    bind: SocketAddr,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => ConsistencyConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConsistencyConfig::default(),
    };
    let registry = Arc::new(build_registry(&config).context("building store registry")?);
    let service = Arc::new(
        ConsistencyService::builder(config, registry)
            .build()
            .context("wiring consistency service")?,
    );
    service.restore().await.context("restoring coordinator state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scan_loop = Arc::clone(&service).spawn(shutdown_rx.clone());

    let mut server_shutdown = shutdown_rx;
    let (addr, server) = warp::serve(routes(service)).bind_with_graceful_shutdown(args.bind, async move {
        while server_shutdown.changed().await.is_ok() {
            if *server_shutdown.borrow() {
                break;
            }
        }
    });
    info!(%addr, version = msc_daemon::VERSION, "msc-daemon listening");
    let server = tokio::spawn(server);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown_tx.send(true).context("broadcasting shutdown")?;

    server.await.context("http server task")?;
    scan_loop.await.context("scan loop task")?;
    info!("msc-daemon stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
