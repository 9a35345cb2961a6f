use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::{AppState, HttpServer};
use turnstile::ratelimit::LimiterRegistry;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(about = "Fixed-window rate limit decision service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<std::net::SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config.as_deref() {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    }
    .with_env()?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    // The backend is chosen here, once, for every limiter
    let registry = Arc::new(LimiterRegistry::from_config(&config.rate_limiting)?);
    info!(backend = registry.backend(), "Rate limiters initialized");

    let state = AppState::new(registry.clone(), config.server.behind_proxy);
    let server = HttpServer::new(config.server.http_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    registry.shutdown().await;
    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
