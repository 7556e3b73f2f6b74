//! Selects every responsive backend, routing each request to one at random.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};
use url::Url;

use crate::locator::PrometheusEndpoint;
use crate::prometheus::scrape::scrape_metric;
use crate::selector::{Strategy, StrategyError};

pub const NAME: &str = "random";

const COMPARISON_METRIC: &str = "prometheus_build_info";

pub fn create(
    client: &reqwest::Client,
    _args: &[String],
) -> Result<Arc<dyn Strategy>, StrategyError> {
    Ok(Arc::new(Random {
        client: client.clone(),
    }))
}

pub struct Random {
    client: reqwest::Client,
}

#[async_trait]
impl Strategy for Random {
    fn name(&self) -> String {
        NAME.to_string()
    }

    fn description(&self) -> &'static str {
        "Selects a prometheus instance at random"
    }

    fn comparison_metric_name(&self) -> &'static str {
        COMPARISON_METRIC
    }

    fn requires_sticky_sessions(&self) -> bool {
        true
    }

    fn next_index(&self, targets: &[Url]) -> usize {
        rand::thread_rng().gen_range(0..targets.len())
    }

    async fn select(&self, candidates: &mut [PrometheusEndpoint]) -> Result<(), StrategyError> {
        let mut selected = 0;
        for endpoint in candidates.iter_mut() {
            endpoint.selected = false;
            if endpoint.query_api.is_none() {
                continue;
            }
            match scrape_metric(&self.client, &endpoint.address, COMPARISON_METRIC).await {
                Ok(Some(scraped)) => {
                    debug!(endpoint = %endpoint.address, %scraped, "endpoint is viable");
                    endpoint.comparison_metric_value = Some(scraped.to_string());
                    endpoint.selected = true;
                    selected += 1;
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
        if selected > 0 {
            Ok(())
        } else {
            Err(StrategyError::none_selected(candidates))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::mock_prometheus_with_samples;

    #[tokio::test]
    async fn test_selects_every_responsive_backend() {
        let healthy_a = mock_prometheus_with_samples(1.0).await;
        let healthy_b = mock_prometheus_with_samples(1.0).await;

        let client = reqwest::Client::new();
        let mut candidates = crate::locator::to_prometheus_clients(
            &client,
            &[
                healthy_a.uri(),
                healthy_b.uri(),
                "http://127.0.0.1:1".to_string(),
            ],
        )
        .await
        .unwrap();

        let strategy = create(&client, &[]).unwrap();
        strategy.select(&mut candidates).await.unwrap();

        assert!(candidates[0].selected);
        assert!(candidates[1].selected);
        assert!(!candidates[2].selected);
    }

    #[tokio::test]
    async fn test_next_index_stays_in_bounds() {
        let client = reqwest::Client::new();
        let strategy = create(&client, &[]).unwrap();
        let targets = vec![
            Url::parse("http://a:9090").unwrap(),
            Url::parse("http://b:9090").unwrap(),
            Url::parse("http://c:9090").unwrap(),
        ];
        for _ in 0..100 {
            assert!(strategy.next_index(&targets) < targets.len());
        }
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
}
