//! termhub-server: persistent terminal sessions over WebSocket.
//!
//! Each session is a shell on its own PTY. Clients attach to a session, detach,
//! and reattach later; recent output is replayed on every attach.

#[cfg(not(unix))]
compile_error!("termhub-server requires a Unix-like platform");

mod bridge;
mod config;
mod control;
mod server;
mod session;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::TermHubServer;
use session::{PtySpawner, SessionRegistry};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// termhub-server: persistent terminal sessions
#[derive(Parser, Debug)]
#[command(name = "termhub-server", version, about = "Persistent terminal sessions over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "APP_PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long, env = "APP_BIND")]
    bind: Option<IpAddr>,

    /// Shell to launch for new sessions
    #[arg(long, env = "APP_SHELL")]
    shell: Option<String>,

    /// Output history kept per session, in bytes
    #[arg(long, env = "APP_BUFFER_SIZE")]
    buffer_size: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.termhub/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termhub-server");

    if let Err(e) = run(cli).await {
        error!("termhub-server failed: {e:#}");
        std::process::exit(1);
    }

    info!("termhub-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        shell: cli.shell,
        buffer_size: cli.buffer_size,
    };
    let config = ServerConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    let registry = Arc::new(SessionRegistry::new(
        config.shell.clone(),
        config.buffer_size,
        Arc::new(PtySpawner),
    ));
    let server = Arc::new(TermHubServer::new(config, registry));

    server.run(shutdown_signal()).await.context("server error")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
