//! OpenTelemetry metrics for the write path.
//!
//! Key metrics:
//! - funnel_writes_processed_total: Counter of committed writes
//! - funnel_writes_failed_total: Counter of dropped or dead-lettered writes
//! - funnel_writes_requeued_total: Counter of contention requeues
//! - funnel_write_latency_seconds: Histogram from pop to commit
//! - funnel_queue_depth: Gauge of pending messages per class
//! - funnel_pool_utilization: Gauge of pool occupancy (0..1)
//! - funnel_log_records_written_total: Counter of batched log rows

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Funnel metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub writes_processed: Counter<u64>,
    pub writes_failed: Counter<u64>,
    pub writes_requeued: Counter<u64>,
    pub write_latency: Histogram<f64>,
    pub queue_depth: Gauge<i64>,
    pub pool_utilization: Gauge<f64>,
    pub log_records_written: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            writes_processed: meter
                .u64_counter("funnel_writes_processed_total")
                .with_description("Writes committed by the coordinator")
                .with_unit("1")
                .init(),
            writes_failed: meter
                .u64_counter("funnel_writes_failed_total")
                .with_description("Writes dropped or dead-lettered")
                .with_unit("1")
                .init(),
            writes_requeued: meter
                .u64_counter("funnel_writes_requeued_total")
                .with_description("Writes re-enqueued after contention")
                .with_unit("1")
                .init(),
            write_latency: meter
                .f64_histogram("funnel_write_latency_seconds")
                .with_description("Time from pop to commit")
                .with_unit("s")
                .init(),
            queue_depth: meter
                .i64_gauge("funnel_queue_depth")
                .with_description("Pending messages per priority class")
                .with_unit("1")
                .init(),
            pool_utilization: meter
                .f64_gauge("funnel_pool_utilization")
                .with_description("(active + overflow) / capacity")
                .with_unit("1")
                .init(),
            log_records_written: meter
                .u64_counter("funnel_log_records_written_total")
                .with_description("Log records inserted by the batch log writer")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    install_manual_reader();
                }
            }
        } else {
            // Metrics are recorded but not exported.
            install_manual_reader();
        }

        Metrics::new(&global::meter("funnel"))
    });
}

fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Record a committed write.
pub fn record_write(table: &str, operation: &str, priority: &str, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("table", table.to_string()),
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("priority", priority.to_string()),
        ];
        m.writes_processed.add(1, &attrs);
        m.write_latency.record(latency_seconds, &attrs);
    }
}

/// Record a write that will not be retried.
pub fn record_write_failed(table: &str, reason: &'static str) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("table", table.to_string()),
            KeyValue::new("reason", reason),
        ];
        m.writes_failed.add(1, &attrs);
    }
}

/// Record a contention requeue.
pub fn record_requeue(table: &str, priority: &str) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("table", table.to_string()),
            KeyValue::new("priority", priority.to_string()),
        ];
        m.writes_requeued.add(1, &attrs);
    }
}

pub fn record_queue_depth(priority: &str, depth: usize) {
    if let Some(m) = METRICS.get() {
        let depth = i64::try_from(depth).unwrap_or(i64::MAX);
        m.queue_depth
            .record(depth, &[KeyValue::new("priority", priority.to_string())]);
    }
}

pub fn record_pool_utilization(backend: &str, utilization: f64) {
    if let Some(m) = METRICS.get() {
        m.pool_utilization
            .record(utilization, &[KeyValue::new("backend", backend.to_string())]);
    }
}

pub fn record_log_records(table: &str, count: usize) {
    if let Some(m) = METRICS.get() {
        m.log_records_written.add(
            count as u64,
            &[KeyValue::new("table", table.to_string())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        assert!(METRICS.get().is_some());

        // Recording after init must not panic.
        record_write("agents", "insert", "critical", 0.002);
        record_write_failed("agents", "execution");
        record_requeue("agents", "normal");
        record_queue_depth("normal", 12);
        record_pool_utilization("sqlite", 0.4);
        record_log_records("agent_logs", 50);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS.get().is_some());
    }
}
