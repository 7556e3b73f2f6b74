//! Process-wide observability bootstrap: tracing and the Prometheus
//! self-metrics recorder.

pub mod metrics;
pub mod tracing_init;
