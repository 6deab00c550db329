//! Process wiring and lifecycle.
//!
//! Opens the pool and the broker, starts the coordinator and the batch log
//! writer on their own threads, runs health reporting on the async runtime,
//! and tears everything down in order on shutdown.
//!
//! The synchronous `postgres` client drives its own runtime, so all pool
//! work happens off the async worker threads.

use anyhow::{anyhow, Context};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{Config, ConfigError};
use crate::coordinator::{CoordinatorHandle, WriteCoordinator};
use crate::log_writer::{ensure_log_table, BatchLogWriter, LogWriterHandle};
use crate::observability::health::HealthReporter;
use crate::observability::http::run_health_server;
use crate::queue::{Broker, MemoryBroker, SqliteBroker, WriteQueue};
use crate::sql::{dialect_for, Translator};
use crate::storage::postgres::PostgresPool;
use crate::storage::sqlite::open_sqlite_pool;
use crate::storage::{BackendKind, StorePool};

/// Connections kept by the SQLite broker's pool.
const BROKER_POOL_SIZE: u32 = 4;

/// Everything started by [`start`].
pub struct Services {
    pub pool: Arc<dyn StorePool>,
    pub queue: WriteQueue,
    pub coordinator: CoordinatorHandle,
    pub log_writer: LogWriterHandle,
    pub reporter: HealthReporter,
}

fn create_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

/// Open the pool for the configured backend.
pub fn open_pool(config: &Config) -> anyhow::Result<Arc<dyn StorePool>> {
    let pool_config = config.pool_config();
    match config.backend {
        BackendKind::Sqlite => {
            create_parent_dir(&config.database_path)?;
            let pool = open_sqlite_pool(&config.database_path, pool_config, config.busy_timeout())
                .context("opening SQLite pool")?;
            Ok(Arc::new(pool))
        }
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::MissingDatabaseUrl)?;
            let pool = PostgresPool::connect(url, pool_config, config.acquire_timeout())
                .context("opening PostgreSQL pool")?;
            Ok(Arc::new(pool))
        }
    }
}

/// Open the configured broker and wrap it in a [`WriteQueue`].
pub fn open_queue(config: &Config) -> anyhow::Result<WriteQueue> {
    let broker: Arc<dyn Broker> = match &config.broker_path {
        Some(path) => {
            create_parent_dir(path)?;
            Arc::new(SqliteBroker::open(path, BROKER_POOL_SIZE).context("opening broker")?)
        }
        None => {
            tracing::warn!("No broker path set; only in-process producers can enqueue");
            Arc::new(MemoryBroker::new())
        }
    };
    Ok(WriteQueue::new(broker, &config.queue_prefix))
}

/// Open storage and start both consumer loops.
pub fn start(config: &Config) -> anyhow::Result<Services> {
    let pool = open_pool(config)?;
    let queue = open_queue(config)?;

    let dialect = dialect_for(pool.backend());
    let translator = Translator::new(Arc::clone(&dialect));
    ensure_log_table(
        pool.as_ref(),
        dialect.as_ref(),
        &config.log_table,
        config.acquire_timeout(),
    )?;

    let coordinator = WriteCoordinator::new(
        Arc::clone(&pool),
        queue.clone(),
        translator.clone(),
        config.coordinator_config(),
    );
    let reporter = HealthReporter::new(
        Arc::clone(&pool),
        queue.clone(),
        coordinator.stats(),
        config.health_interval(),
    );
    let coordinator = coordinator.spawn().context("spawning write coordinator")?;

    let log_writer = BatchLogWriter::new(
        Arc::clone(&pool),
        queue.clone(),
        translator,
        config.log_writer_config(),
    )?
    .spawn()
    .context("spawning batch log writer")?;

    tracing::info!(
        backend = %pool.backend(),
        prefix = %queue.names().prefix(),
        "Funnel started"
    );

    Ok(Services {
        pool,
        queue,
        coordinator,
        log_writer,
        reporter,
    })
}

/// Stop both loops, wait for them, then close the pool.
pub fn stop(services: Services) -> anyhow::Result<()> {
    services.coordinator.shutdown();
    services.log_writer.shutdown();

    let coordinator = services.coordinator.join();
    let log_writer = services.log_writer.join();
    services.pool.close_all();

    coordinator.map_err(|_| anyhow!("write coordinator panicked"))?;
    log_writer.map_err(|_| anyhow!("batch log writer panicked"))?;
    Ok(())
}

/// Run Funnel until `shutdown_rx` changes.
pub async fn run_server(
    config: Config,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    config.validate()?;
    let health_addr = config.health_addr()?;

    let services = tokio::task::spawn_blocking(move || start(&config)).await??;

    let health_task = tokio::spawn(services.reporter.clone().run(shutdown_rx.clone()));
    let http_task = health_addr.map(|addr| {
        tokio::spawn(run_health_server(
            addr,
            services.reporter.clone(),
            shutdown_rx.clone(),
        ))
    });

    // Wait for shutdown signal
    let _ = shutdown_rx.changed().await;
    tracing::info!("Shutdown signal received, stopping");

    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "Health reporter task failed");
    }
    if let Some(task) = http_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Health server failed"),
            Err(e) => tracing::warn!(error = %e, "Health server task failed"),
        }
    }

    tokio::task::spawn_blocking(move || stop(services)).await??;

    tracing::info!("Server stopped");
    Ok(())
}
