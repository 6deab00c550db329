//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the process.
///
/// `RUST_LOG` takes precedence over `default_level`. With `json` set, events
/// are written as one JSON object per line for log shippers.
///
/// # Panics
///
/// Panics if tracing has already been initialized.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,funnel={default_level}")));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .init();
    }

    tracing::info!(level = default_level, json, "Tracing initialized");
}
