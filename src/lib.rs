//! Funnel: priority write coordination for a shared SQL store.
//!
//! Many uncoordinated producers enqueue database mutations; a single
//! consumer drains them in strict priority order against a bounded
//! connection pool, retrying on lock contention.
//!
//! # Architecture
//!
//! - **Single writer**: only the coordinator and the batch log writer execute writes
//! - **Strict priority**: critical, then priority, then a bounded batch of normal
//! - **Two backends**: embedded SQLite or PostgreSQL behind one pool interface
//! - **Observable**: tracing, OpenTelemetry metrics and a health snapshot
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`coordinator`]: Priority drain loop and write counters
//! - [`log_writer`]: Batched multi-row inserts for log records
//! - [`message`]: Write messages and log records
//! - [`observability`]: Tracing, metrics and health reporting
//! - [`queue`]: Broker-backed priority channels and callback slots
//! - [`server`]: Process wiring and lifecycle
//! - [`sql`]: Dialects, values and statement translation
//! - [`storage`]: Connection pools for both backends

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::pool::PoolConfig is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod coordinator;
pub mod log_writer;
pub mod message;
pub mod observability;
pub mod queue;
pub mod server;
pub mod sql;
pub mod storage;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) message ID.
///
/// # Example
///
/// ```
/// let id = funnel::generate_message_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_message_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
