//! Prometheus self-metrics bootstrap.
//!
//! Installs the process-wide recorder once at startup and keeps the handle
//! around for the exposition endpoint. Individual metrics register
//! implicitly on first use through the `metrics` macros.

use std::sync::OnceLock;

use metrics::gauge;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Default namespace prefixing every self-metric.
pub const DEFAULT_NAMESPACE: &str = "mpp";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    Install(#[from] BuildError),
    #[error("metrics recorder already initialized")]
    AlreadyInitialized,
}

/// Install the Prometheus recorder and publish build information.
pub fn init_metrics(namespace: &str) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    gauge!(
        format!("{namespace}_build_info"),
        "version" => version(),
        "revision" => revision(),
        "branch" => branch(),
        "rustversion" => rust_version()
    )
    .set(1.0);
    Ok(())
}

/// Render the current text exposition, or `None` before the recorder is
/// installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn revision() -> &'static str {
    option_env!("MPP_BUILD_REVISION").unwrap_or("unknown")
}

pub fn branch() -> &'static str {
    option_env!("MPP_BUILD_BRANCH").unwrap_or("unknown")
}

pub fn rust_version() -> &'static str {
    option_env!("MPP_RUSTC_VERSION").unwrap_or("unknown")
}
