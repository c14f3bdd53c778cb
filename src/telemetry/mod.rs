//! Telemetry sinks injected into every component
//!
//! Components never reach for a process-wide logger or metrics client.
//! They receive a [`LogSink`] and a [`MetricsSink`] at construction:
//!
//! - **Logging**: [`TracingLogSink`] forwards to `tracing`, [`MemoryLogSink`] records for tests
//! - **Metrics**: [`MetricsRegistry`] backs the Prometheus endpoint, [`StatsdSink`]
//!   pushes DogStatsD lines over UDP, [`FanoutMetrics`] combines them

pub mod logging;
pub mod metrics;

pub use logging::{
    Attributes, LogEntry, LogLevel, LogSink, MemoryLogSink, SharedLogSink, TracingLogSink,
};
pub use metrics::{
    tags, FanoutMetrics, MetricsRegistry, MetricsSink, NoopMetrics, SharedMetrics, StatsdSink,
    Tags,
};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `info`, or `debug`
/// when `logging.debug` is enabled. Must be called once, from `main`.
pub fn init_tracing(logging: &LoggingConfig) {
    let default_level = if logging.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}
