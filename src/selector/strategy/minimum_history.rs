//! Selects backends whose data reaches back at least a configured duration,
//! verified with an instant `max(up)` query evaluated in the past.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error};
use url::Url;

use crate::locator::PrometheusEndpoint;
use crate::prometheus::query::QueryValue;
use crate::selector::{Strategy, StrategyError};

pub const NAME: &str = "minimum-history";

const HISTORY_QUERY: &str = "max(up)";

pub fn create(
    _client: &reqwest::Client,
    args: &[String],
) -> Result<Arc<dyn Strategy>, StrategyError> {
    let raw = args.first().ok_or(StrategyError::MissingArgument {
        name: NAME,
        what: "{minimum-duration}",
    })?;
    let minimum_history =
        humantime::parse_duration(raw).map_err(|err| StrategyError::InvalidArgument {
            name: NAME,
            what: "minimum duration",
            value: raw.clone(),
            reason: err.to_string(),
        })?;
    Ok(Arc::new(MinimumHistory { minimum_history }))
}

pub struct MinimumHistory {
    minimum_history: Duration,
}

#[async_trait]
impl Strategy for MinimumHistory {
    fn name(&self) -> String {
        format!("{NAME}:{}", humantime::format_duration(self.minimum_history))
    }

    fn description(&self) -> &'static str {
        "Selects instances having at least a minimum amount of history, at random"
    }

    fn comparison_metric_name(&self) -> &'static str {
        "up"
    }

    fn requires_sticky_sessions(&self) -> bool {
        true
    }

    fn next_index(&self, targets: &[Url]) -> usize {
        rand::thread_rng().gen_range(0..targets.len())
    }

    async fn select(&self, candidates: &mut [PrometheusEndpoint]) -> Result<(), StrategyError> {
        let at = SystemTime::now() - self.minimum_history;
        let mut selected = 0;

        for endpoint in candidates.iter_mut() {
            endpoint.selected = false;
            let Some(api) = &endpoint.query_api else {
                continue;
            };
            match api.query(HISTORY_QUERY, at).await {
                Ok(QueryValue::Vector(samples)) if !samples.is_empty() => {
                    debug!(endpoint = %endpoint.address, samples = samples.len(),
                        "endpoint has sufficient history");
                    endpoint.comparison_metric_value = Some(
                        samples
                            .iter()
                            .map(format_sample)
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                    endpoint.selected = true;
                    selected += 1;
                }
                Ok(QueryValue::Vector(_)) => {
                    debug!(endpoint = %endpoint.address,
                        "no history at the requested offset");
                }
                Ok(QueryValue::Other(result_type)) => {
                    error!(endpoint = %endpoint.address, result_type,
                        "history query returned unexpected type");
                }
                Err(err) => {
                    error!(endpoint = %endpoint.address, error = %err,
                        "history query failed");
                }
            }
        }
        if selected > 0 {
            Ok(())
        } else {
            Err(StrategyError::none_selected(candidates))
        }
    }
}

/// Render a vector sample the way the status page shows it:
/// `{label="value",…} => <value>`.
fn format_sample(sample: &crate::prometheus::query::VectorSample) -> String {
    let labels = sample
        .metric
        .iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{labels}}} => {}", sample.value.1)
}
