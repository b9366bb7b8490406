//! Observability utilities: logging setup and the metrics sink.

mod logging;
mod metrics;

pub use logging::init_tracing;
pub use metrics::{
    metric_names, InMemoryMetricsSink, LoggingMetricsSink, MetricsSink, NoOpMetricsSink,
};
