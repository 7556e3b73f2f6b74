//! Pluggable discovery of candidate Prometheus backends.
//!
//! A [`Locator`] produces a fresh set of candidate endpoints on every call;
//! implementations never cache. The shared [`to_prometheus_clients`] contract
//! turns raw URLs into probed [`PrometheusEndpoint`]s: it binds a query
//! client, derives process uptime from `process_start_time_seconds`, and
//! issues a throwaway `up` query as a reachability check.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::prometheus::query::QueryApi;
use crate::prometheus::scrape::{ScrapeError, scrape_metric};

pub mod endpoints_file;
pub mod kubernetes;
pub mod marathon;
pub mod marathon_auth;

/// Gauge exposing the backend's process start, in seconds since the epoch.
const START_TIME_METRIC: &str = "process_start_time_seconds";

/// A candidate backend surfaced by a locator this round, whether or not it
/// turned out to be probe-viable.
#[derive(Debug, Clone, Default)]
pub struct PrometheusEndpoint {
    /// Absolute `scheme://host[:port]` URL; stable for the endpoint's life.
    pub address: String,
    /// Instant-query handle; `None` when the candidate could not be
    /// constructed or probed, in which case strategies must skip it.
    pub query_api: Option<QueryApi>,
    /// Time since the backend's process start, or zero when unknown.
    pub uptime: Duration,
    /// Set by the strategy; only meaningful within one selection round.
    pub selected: bool,
    /// Last construction or probe error.
    pub error: Option<String>,
    /// Opaque ranking value recorded by the strategy for the status page.
    pub comparison_metric_value: Option<String>,
}

impl PrometheusEndpoint {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Self::default()
        }
    }
}

impl std::fmt::Display for PrometheusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Unable to locate any potential endpoints")]
    NoEndpoints,
    /// Discovery partially succeeded; the endpoints carried here must still
    /// be merged into the round's candidates.
    #[error("{reason}")]
    Partial {
        endpoints: Vec<PrometheusEndpoint>,
        reason: String,
    },
    #[error("failed to read endpoints file '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure kubernetes client: {reason}")]
    KubeConfig { reason: String },
    #[error(transparent)]
    Kubernetes(#[from] kube::Error),
    #[error("marathon request to '{url}' failed: {reason}")]
    Marathon { url: String, reason: String },
    #[error(transparent)]
    Auth(#[from] marathon_auth::AuthError),
}

/// A pluggable discovery source for prometheus endpoints.
#[async_trait]
pub trait Locator: Send + Sync {
    /// Run one discovery round, returning every candidate found.
    async fn endpoints(&self) -> Result<Vec<PrometheusEndpoint>, LocatorError>;

    /// Short human-readable identity, used in log fields.
    fn describe(&self) -> String;
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("metric '{START_TIME_METRIC}' not present at {0}")]
    MissingStartTime(String),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

/// Turn a list of raw URLs into probed endpoints.
///
/// Every non-blank URL contributes exactly one entry: viable candidates get a
/// bound [`QueryApi`] and a measured uptime, while construction or probe
/// failures keep the address with the error recorded. An empty outcome is an
/// error.
pub async fn to_prometheus_clients(
    client: &reqwest::Client,
    urls: &[String],
) -> Result<Vec<PrometheusEndpoint>, LocatorError> {
    let mut endpoints = Vec::with_capacity(urls.len());
    for raw in urls {
        let address = raw.trim();
        if address.is_empty() {
            continue;
        }
        let mut endpoint = PrometheusEndpoint::new(address);
        match QueryApi::new(client.clone(), address) {
            Ok(api) => match probe(client, &api, address).await {
                Ok(uptime) => {
                    endpoint.uptime = uptime;
                    endpoint.query_api = Some(api);
                }
                Err(err) => {
                    endpoint.error = Some(err.to_string());
                }
            },
            Err(err) => {
                endpoint.error = Some(err.to_string());
            }
        }
        endpoints.push(endpoint);
    }
    if endpoints.is_empty() {
        return Err(LocatorError::NoEndpoints);
    }
    Ok(endpoints)
}

/// Probe one backend: derive uptime from its start-time gauge and run a
/// throwaway `up` query as a reachability check.
async fn probe(
    client: &reqwest::Client,
    api: &QueryApi,
    address: &str,
) -> Result<Duration, ProbeError> {
    let scraped = scrape_metric(client, address, START_TIME_METRIC)
        .await?
        .ok_or_else(|| ProbeError::MissingStartTime(address.to_string()))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let uptime = Duration::from_secs_f64((now - scraped.value).max(0.0));

    // The endpoint stays viable even when this query fails, as long as the
    // start-time scrape above succeeded.
    if let Err(err) = api.query("up", SystemTime::now()).await {
        warn!(endpoint = address, error = %err, "'up' reachability query failed");
    }
    Ok(uptime)
}
