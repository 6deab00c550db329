//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing via `tracing-subscriber`
//! - OpenTelemetry metrics for the write path
//! - Health snapshots, published periodically and over HTTP

pub mod health;
pub mod http;
pub mod metrics;
pub mod tracing;

pub use health::{HealthReporter, HealthSnapshot, QueueStatus};
