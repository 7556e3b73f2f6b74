//! Selects the single backend holding the most ingested samples.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::locator::PrometheusEndpoint;
use crate::prometheus::scrape::scrape_metric;
use crate::selector::{Strategy, StrategyError};

pub const NAME: &str = "single-most-data";

const COMPARISON_METRIC: &str = "prometheus_local_storage_ingested_samples_total";

pub fn create(
    client: &reqwest::Client,
    _args: &[String],
) -> Result<Arc<dyn Strategy>, StrategyError> {
    Ok(Arc::new(SingleMostData {
        client: client.clone(),
    }))
}

pub struct SingleMostData {
    client: reqwest::Client,
}

#[async_trait]
impl Strategy for SingleMostData {
    fn name(&self) -> String {
        NAME.to_string()
    }

    fn description(&self) -> &'static str {
        "Selects the single prometheus instance with the most ingested samples"
    }

    fn comparison_metric_name(&self) -> &'static str {
        COMPARISON_METRIC
    }

    fn requires_sticky_sessions(&self) -> bool {
        false
    }

    fn next_index(&self, _targets: &[Url]) -> usize {
        0
    }

    async fn select(&self, candidates: &mut [PrometheusEndpoint]) -> Result<(), StrategyError> {
        let mut most_data: i64 = 0;
        let mut most_data_index = None;

        for (i, endpoint) in candidates.iter_mut().enumerate() {
            endpoint.selected = false;
            if endpoint.query_api.is_none() {
                continue;
            }
            match scrape_metric(&self.client, &endpoint.address, COMPARISON_METRIC).await {
                Ok(Some(scraped)) => {
                    debug!(endpoint = %endpoint.address, value = scraped.value,
                        "scraped comparison metric");
                    let samples = scraped.value as i64;
                    endpoint.comparison_metric_value = Some(samples.to_string());
                    if samples > most_data {
                        most_data = samples;
                        most_data_index = Some(i);
                    }
                }
                Ok(None) => {
                    warn!(endpoint = %endpoint.address,
                        "comparison metric '{COMPARISON_METRIC}' not found");
                    endpoint.error =
                        Some(format!("metric '{COMPARISON_METRIC}' not found"));
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.address, error = %err,
                        "failed to scrape comparison metric");
                    endpoint.error = Some(err.to_string());
                }
            }
        }

        match most_data_index {
            Some(i) => {
                candidates[i].selected = true;
                Ok(())
            }
            None => Err(StrategyError::none_selected(candidates)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::mock_prometheus_with_samples;

    #[tokio::test]
    async fn test_selects_the_highest_sample_count() {
        let small = mock_prometheus_with_samples(100.0).await;
        let large = mock_prometheus_with_samples(5000.0).await;

        let client = reqwest::Client::new();
        let mut candidates =
            crate::locator::to_prometheus_clients(&client, &[small.uri(), large.uri()])
                .await
                .unwrap();

        let strategy = create(&client, &[]).unwrap();
        strategy.select(&mut candidates).await.unwrap();

        assert!(!candidates[0].selected);
        assert!(candidates[1].selected);
        assert_eq!(candidates[1].comparison_metric_value.as_deref(), Some("5000"));
    }

    #[tokio::test]
    async fn test_errors_when_nothing_responds() {
        let client = reqwest::Client::new();
        let mut candidates =
            crate::locator::to_prometheus_clients(&client, &["http://127.0.0.1:1".to_string()])
                .await
                .unwrap();

        let strategy = create(&client, &[]).unwrap();
        let err = strategy.select(&mut candidates).await.unwrap_err();
        assert!(matches!(err, StrategyError::NoneSelected { .. }));
    }

    #[tokio::test]
    async fn test_next_index_is_always_first() {
        let client = reqwest::Client::new();
        let strategy = create(&client, &[]).unwrap();
        let targets = vec![
            Url::parse("http://a:9090").unwrap(),
            Url::parse("http://b:9090").unwrap(),
        ];
        assert_eq!(strategy.next_index(&targets), 0);
    }
}
