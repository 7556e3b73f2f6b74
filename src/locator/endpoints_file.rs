//! Locator backed by a flat file of endpoint URLs, one per line.
//!
//! The file is re-read on every discovery round, so edits take effect at the
//! next selection interval without a restart.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{Locator, LocatorError, PrometheusEndpoint, to_prometheus_clients};

pub struct EndpointsFileLocator {
    path: PathBuf,
    client: reqwest::Client,
}

impl EndpointsFileLocator {
    pub fn new(client: reqwest::Client, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            client,
        }
    }
}

#[async_trait]
impl Locator for EndpointsFileLocator {
    async fn endpoints(&self) -> Result<Vec<PrometheusEndpoint>, LocatorError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| LocatorError::File {
                path: self.path.display().to_string(),
                source,
            })?;
        // `lines` handles both LF and CRLF; blank lines are dropped by the
        // shared contract after trimming.
        let urls: Vec<String> = contents.lines().map(str::to_string).collect();
        to_prometheus_clients(&self.client, &urls).await
    }

    fn describe(&self) -> String {
        format!("endpoints-file{{path: {}}}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::tests::support::metrics_document;

    #[tokio::test]
    async fn test_reads_crlf_and_blank_lines() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(metrics_document(1.0)))
            .mount(&server)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}\r\n\r\n  \nhttp://127.0.0.1:1\n", server.uri()).unwrap();

        let locator = EndpointsFileLocator::new(reqwest::Client::new(), file.path());
        let endpoints = locator.endpoints().await.unwrap();

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].address, server.uri());
        assert!(endpoints[0].query_api.is_some());
        assert_eq!(endpoints[1].address, "http://127.0.0.1:1");
        assert!(endpoints[1].error.is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let locator =
            EndpointsFileLocator::new(reqwest::Client::new(), "/nonexistent/endpoints.txt");
        let err = locator.endpoints().await.unwrap_err();
        assert!(matches!(err, LocatorError::File { .. }));
    }
}
