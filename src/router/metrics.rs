//! Self-metric recording for the routing plane.
//!
//! All metrics live under one configurable namespace (`mpp` by default) and
//! are registered implicitly on first use through the `metrics` facade; the
//! exposition itself is rendered by `observability::metrics`.

use std::time::Duration;

use metrics::{counter, gauge};

use super::affinity::AffinityOption;

/// Recording surface for the router's Prometheus self-metrics.
#[derive(Debug, Clone)]
pub struct RouterMetrics {
    namespace: String,
}

impl RouterMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_{metric}", self.namespace)
    }

    /// Gauge: the number of currently selected backends.
    pub fn record_selected_backends(&self, count: usize) {
        gauge!(self.name("selected_backends")).set(count as f64);
    }

    /// Counter: completed selection rounds.
    pub fn record_selection_event(&self) {
        counter!(self.name("selection_events")).increment(1);
    }

    /// Counter: requests routed, by backend.
    pub fn record_request(&self, backend: &str) {
        counter!(self.name("requests"), "backend" => backend.to_string()).increment(1);
    }

    /// Counter: transparent retries, by the backend that failed.
    pub fn record_retry(&self, backend: &str) {
        counter!(self.name("retries"), "backend" => backend.to_string()).increment(1);
    }

    /// Counter: cumulative milliseconds spent responding, by backend.
    pub fn record_response_time(&self, backend: &str, elapsed: Duration) {
        counter!(self.name("response_milliseconds"), "backend" => backend.to_string())
            .increment(elapsed.as_millis() as u64);
    }

    /// Counter: requests routed on an affinity match, by affinity type.
    pub fn record_affinity_hit(&self, kind: AffinityOption) {
        counter!(self.name("affinity_hits"), "type" => kind.as_str()).increment(1);
    }
}
