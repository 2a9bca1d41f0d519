use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StorageBackend, StorageConfig, TurnstileConfig};
use turnstile::http::{AppState, HttpServer};
use turnstile::ratelimit::RateLimiter;
use turnstile::store::{MemoryStore, RateLimitStore, RedisStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "turnstile")]
#[command(about = "Per-IP and per-token request rate limiting")]
#[command(version)]
struct Args {
    /// YAML configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let store = open_store(&config.storage).await;

    let rate_limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone())?);
    info!(
        ip_requests_per_second = config.rate_limit.ip_requests_per_second,
        tokens = config.rate_limit.token_limits.len(),
        "Rate limiter initialized"
    );

    let state = AppState::new(rate_limiter, config.server.request_timeout());
    let server = HttpServer::new(config.server.listen_addr, state);

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = store.close().await {
        error!(error = %e, "Error closing store");
    }

    served?;
    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the configured store, falling back to memory if Redis is unreachable.
async fn open_store(config: &StorageConfig) -> Arc<dyn RateLimitStore> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Redis => match RedisStore::connect(&config.redis.store_config()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Failed to connect to Redis, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        },
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
