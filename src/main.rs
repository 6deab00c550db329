//! Funnel: priority write coordination for a shared SQL store.
//!
//! # Usage
//!
//! ```bash
//! funnel --backend sqlite --database-path ./data/funnel.db --broker-path ./data/broker.db
//! ```
//!
//! Environment variables can also be used:
//! - `FUNNEL_BACKEND`: `sqlite` or `postgres`
//! - `FUNNEL_DATABASE_URL`: PostgreSQL connection URL
//! - `FUNNEL_BROKER_PATH`: Shared broker file producers enqueue into
//! - `FUNNEL_LOG_LEVEL`: Log level (trace, debug, info, warn, error)

use funnel::config::Config;
use funnel::observability::metrics::init_metrics_with_endpoint;
use funnel::observability::tracing::init_tracing;
use funnel::server::run_server;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let pool = config.pool_config();
    let target = match &config.database_url {
        Some(_) if config.backend == funnel::storage::BackendKind::Postgres => {
            "(database url)".to_string()
        }
        _ => config.database_path.display().to_string(),
    };
    let broker = config
        .broker_path
        .as_ref()
        .map_or_else(|| "in-process".to_string(), |p| p.display().to_string());
    eprintln!(
        r#"
  Funnel v{version} - priority write coordinator

  Configuration:
    Backend:    {backend} ({target})
    Pool:       {base} base + {overflow} overflow
    Broker:     {broker}
    Prefix:     {prefix}
    Log Level:  {level}

  Press Ctrl+C to shutdown gracefully.
"#,
        backend = config.backend,
        base = pool.base_size,
        overflow = pool.overflow_cap,
        prefix = config.queue_prefix,
        level = config.log_level,
    );
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = ctrl_c.await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating shutdown...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level, config.log_json);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    print_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    run_server(config, shutdown_rx).await?;

    tracing::info!("Funnel shutdown complete");
    Ok(())
}
