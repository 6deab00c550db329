//! Configuration parsing for Funnel.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides (`FUNNEL_*`)
//! - Backend-dependent pool defaults

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::coordinator::CoordinatorConfig;
use crate::log_writer::{BatchLimits, LogWriterConfig, DEFAULT_LOG_TABLE, MAX_LOG_BATCH_SIZE};
use crate::observability::health::DEFAULT_HEALTH_INTERVAL;
use crate::queue::DEFAULT_PREFIX;
use crate::sql::is_valid_identifier;
use crate::storage::{BackendKind, PoolConfig};

/// Error type for configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--database-url is required for the postgres backend")]
    MissingDatabaseUrl,

    #[error("invalid log table name: {0:?}")]
    InvalidLogTable(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("log batch size {0} exceeds the maximum of {MAX_LOG_BATCH_SIZE}")]
    LogBatchTooLarge(usize),

    #[error("invalid health address: {0}")]
    HealthAddr(#[from] std::net::AddrParseError),
}

/// Funnel: priority write coordination for a shared SQL store.
#[derive(Parser, Debug, Clone)]
#[command(name = "funnel")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Storage backend
    #[arg(long, env = "FUNNEL_BACKEND", value_enum, default_value_t = BackendKind::Sqlite)]
    pub backend: BackendKind,

    /// SQLite database file (sqlite backend)
    #[arg(long, env = "FUNNEL_DATABASE_PATH", default_value = "./data/funnel.db")]
    pub database_path: PathBuf,

    /// PostgreSQL connection URL (postgres backend)
    #[arg(long, env = "FUNNEL_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Base pool size [default: 10 for sqlite, 5 for postgres]
    #[arg(long, env = "FUNNEL_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Connections allowed beyond the base size [default: 20 for sqlite, 10 for postgres]
    #[arg(long, env = "FUNNEL_POOL_OVERFLOW")]
    pub pool_overflow: Option<usize>,

    /// Connection recycle age in seconds
    #[arg(long, env = "FUNNEL_POOL_RECYCLE_SECS", default_value_t = 3600)]
    pub pool_recycle_secs: u64,

    /// Pool checkout timeout in milliseconds
    #[arg(long, env = "FUNNEL_ACQUIRE_TIMEOUT_MS", default_value_t = 30_000)]
    pub acquire_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds
    #[arg(long, env = "FUNNEL_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    pub busy_timeout_ms: u64,

    /// Shared SQLite broker file; in-process broker when unset
    #[arg(long, env = "FUNNEL_BROKER_PATH")]
    pub broker_path: Option<PathBuf>,

    /// Prefix for queue channel names
    #[arg(long, env = "FUNNEL_QUEUE_PREFIX", default_value = DEFAULT_PREFIX)]
    pub queue_prefix: String,

    /// Normal-priority messages executed per drain cycle
    #[arg(long, env = "FUNNEL_NORMAL_BATCH_SIZE", default_value_t = 10)]
    pub normal_batch_size: usize,

    /// How long an idle drain cycle waits, in milliseconds
    #[arg(long, env = "FUNNEL_POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    /// Sleep before requeueing after contention, in milliseconds
    #[arg(long, env = "FUNNEL_CONTENTION_BACKOFF_MS", default_value_t = 200)]
    pub contention_backoff_ms: u64,

    /// Requeues before a message is dead-lettered
    #[arg(long, env = "FUNNEL_MAX_CONTENTION_RETRIES", default_value_t = 1000)]
    pub max_contention_retries: u32,

    /// Records per batch log insert
    #[arg(long, env = "FUNNEL_LOG_BATCH_SIZE", default_value_t = 100)]
    pub log_batch_size: usize,

    /// Table receiving batched log records
    #[arg(long, env = "FUNNEL_LOG_TABLE", default_value = DEFAULT_LOG_TABLE)]
    pub log_table: String,

    /// Health publish interval in seconds
    #[arg(long, env = "FUNNEL_HEALTH_INTERVAL_SECS", default_value_t = DEFAULT_HEALTH_INTERVAL.as_secs())]
    pub health_interval_secs: u64,

    /// Host for the HTTP health endpoint
    #[arg(long, env = "FUNNEL_HEALTH_HOST", default_value = "127.0.0.1")]
    pub health_host: String,

    /// Port for the HTTP health endpoint; disabled when unset
    #[arg(long, env = "FUNNEL_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "FUNNEL_LOG_JSON")]
    pub log_json: bool,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check settings clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::Postgres && self.database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if !is_valid_identifier(&self.log_table) {
            return Err(ConfigError::InvalidLogTable(self.log_table.clone()));
        }
        let positive = [
            ("pool size", self.pool_config().base_size),
            ("normal batch size", self.normal_batch_size),
            ("log batch size", self.log_batch_size),
            ("health interval", self.health_interval_secs as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.log_batch_size > MAX_LOG_BATCH_SIZE {
            return Err(ConfigError::LogBatchTooLarge(self.log_batch_size));
        }
        self.health_addr()?;
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            base_size: self
                .pool_size
                .unwrap_or_else(|| self.backend.default_pool_size()),
            overflow_cap: self
                .pool_overflow
                .unwrap_or_else(|| self.backend.default_overflow()),
            recycle_age: Duration::from_secs(self.pool_recycle_secs),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Address for the HTTP health endpoint, if enabled.
    pub fn health_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match self.health_port {
            Some(port) => Ok(Some(format!("{}:{port}", self.health_host).parse()?)),
            None => Ok(None),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            normal_batch_size: self.normal_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            acquire_timeout: self.acquire_timeout(),
            contention_backoff: Duration::from_millis(self.contention_backoff_ms),
            max_contention_retries: self.max_contention_retries,
        }
    }

    pub fn log_writer_config(&self) -> LogWriterConfig {
        LogWriterConfig {
            table: self.log_table.clone(),
            limits: BatchLimits {
                max_records: self.log_batch_size,
                ..BatchLimits::default()
            },
            acquire_timeout: self.acquire_timeout(),
            ..LogWriterConfig::default()
        }
    }

    /// Create a configuration for tests: SQLite under `data_dir`, fast loops.
    #[cfg(test)]
    pub fn test_config(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("funnel.db"),
            pool_size: Some(2),
            pool_overflow: Some(2),
            poll_interval_ms: 10,
            contention_backoff_ms: 5,
            health_interval_secs: 1,
            log_level: "debug".into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            database_path: PathBuf::from("./data/funnel.db"),
            database_url: None,
            pool_size: None,
            pool_overflow: None,
            pool_recycle_secs: 3600,
            acquire_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            broker_path: None,
            queue_prefix: DEFAULT_PREFIX.into(),
            normal_batch_size: 10,
            poll_interval_ms: 1_000,
            contention_backoff_ms: 200,
            max_contention_retries: 1000,
            log_batch_size: 100,
            log_table: DEFAULT_LOG_TABLE.into(),
            health_interval_secs: DEFAULT_HEALTH_INTERVAL.as_secs(),
            health_host: "127.0.0.1".into(),
            health_port: None,
            log_level: "info".into(),
            log_json: false,
            otel_endpoint: None,
        }
    }
}
