//! EchoFS controller server binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use echofs_api::{start_server, ApiConfig};

/// Adaptive-consistency object store controller.
#[derive(Debug, Parser)]
#[command(name = "echofs-controller", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log filter, e.g. "info" or "echofs_cluster=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs instead of human-readable ones
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let mut config = match ApiConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            return Err(err);
        }
    };
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--listen must be host:port"))?;
        config.listen.host = host.to_string();
        config.listen.port = port.parse()?;
    }

    info!(
        listen = %config.listen.addr(),
        workers = config.echo.pool.workers.len(),
        store_dir = %config.echo.store_dir.display(),
        "Starting EchoFS controller"
    );

    tokio::select! {
        result = start_server(config) => {
            match result {
                Ok(()) => info!("Server stopped"),
                Err(err) => {
                    error!(error = %err, "Server error");
                    return Err(err);
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping");
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))?;

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
