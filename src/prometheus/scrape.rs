//! Line-oriented scraping of the Prometheus text exposition format.
//!
//! Strategies and probes only ever need the first instance of a single named
//! gauge, so this deliberately stops far short of a full exposition parser.

use thiserror::Error;

/// A single sample pulled out of a `/metrics` document.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedMetric {
    pub name: String,
    /// The raw label block, braces included; empty for unlabeled samples.
    pub labels: String,
    pub value: f64,
}

impl std::fmt::Display for ScrapedMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{} {}", self.name, self.labels, self.value)
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("GET {url} returned status {status}")]
    BadStatus { url: String, status: u16 },
    #[error("unparsable value for metric '{name}' in line '{line}'")]
    BadValue { name: String, line: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Fetch `<addr>/metrics` and return the first instance of the named metric.
///
/// Returns `Ok(None)` when the metric is absent from the document; callers
/// accept first-instance ambiguity for metrics with multiple label sets.
pub async fn scrape_metric(
    client: &reqwest::Client,
    addr: &str,
    name: &str,
) -> Result<Option<ScrapedMetric>, ScrapeError> {
    let url = format!("{}/metrics", addr.trim_end_matches('/'));
    let response = client.get(&url).send().await?;
    if response.status().as_u16() != 200 {
        return Err(ScrapeError::BadStatus {
            url,
            status: response.status().as_u16(),
        });
    }
    let document = response.text().await?;
    find_metric(&document, name)
}

/// Scan an exposition document for the first sample of `name`.
fn find_metric(document: &str, name: &str) -> Result<Option<ScrapedMetric>, ScrapeError> {
    for line in document.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_and_labels, raw_value)) = line.split_once(' ') else {
            continue;
        };
        let (metric_name, labels) = match name_and_labels.split_once('{') {
            Some((metric_name, rest)) => (metric_name, format!("{{{rest}")),
            None => (name_and_labels, String::new()),
        };
        if metric_name != name {
            continue;
        }
        let value: f64 = raw_value
            .trim()
            .parse()
            .map_err(|_| ScrapeError::BadValue {
                name: name.to_string(),
                line: line.to_string(),
            })?;
        return Ok(Some(ScrapedMetric {
            name: metric_name.to_string(),
            labels,
            value,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const SAMPLE_DOCUMENT: &str = "\
# HELP process_start_time_seconds Start time of the process since unix epoch in seconds.
# TYPE process_start_time_seconds gauge
process_start_time_seconds 1.5021274556e+09
up 1
prometheus_build_info{branch=\"master\",version=\"1.5.2\"} 1
";

    #[test]
    fn test_find_metric_returns_first_instance() {
        let scraped = find_metric(SAMPLE_DOCUMENT, "process_start_time_seconds")
            .unwrap()
            .unwrap();
        assert_eq!(scraped.name, "process_start_time_seconds");
        assert_eq!(scraped.labels, "");
        assert_eq!(scraped.value, 1502127455.6);
    }

    #[test]
    fn test_find_metric_preserves_label_block() {
        let scraped = find_metric(SAMPLE_DOCUMENT, "prometheus_build_info")
            .unwrap()
            .unwrap();
        assert_eq!(scraped.labels, "{branch=\"master\",version=\"1.5.2\"}");
        assert_eq!(scraped.value, 1.0);
    }

    #[rstest]
    #[case("nonexistent_metric")]
    #[case("process_start_time")]
    #[case("up_")]
    fn test_find_metric_absent_is_none(#[case] name: &str) {
        assert!(find_metric(SAMPLE_DOCUMENT, name).unwrap().is_none());
    }

    #[test]
    fn test_find_metric_bad_value_is_error() {
        let err = find_metric("up not-a-number\n", "up").unwrap_err();
        assert!(matches!(err, ScrapeError::BadValue { .. }));
    }

    #[test]
    fn test_find_metric_skips_comments_and_blanks() {
        let document = "# up 99\n\n# TYPE up gauge\nup 1\n";
        let scraped = find_metric(document, "up").unwrap().unwrap();
        assert_eq!(scraped.value, 1.0);
    }

    #[tokio::test]
    async fn test_scrape_metric_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_DOCUMENT))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let scraped = scrape_metric(&client, &server.uri(), "process_start_time_seconds")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scraped.value, 1502127455.6);
    }

    #[tokio::test]
    async fn test_scrape_metric_non_200_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = scrape_metric(&client, &server.uri(), "up").await.unwrap_err();
        assert!(matches!(err, ScrapeError::BadStatus { status: 502, .. }));
    }
}
