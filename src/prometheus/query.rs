//! Minimal instant-query client for the Prometheus HTTP API.
//!
//! Each candidate backend gets one [`QueryApi`] bound to its address; the
//! proxy only ever issues instant queries (`/api/v1/query`) and only inspects
//! vector results, so that is all this client models.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone)]
pub struct QueryApi {
    base: Url,
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("'{address}' is not an absolute URL: {source}")]
    Address {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("query '{expr}' against {url} returned status {status}")]
    BadStatus {
        expr: String,
        url: String,
        status: u16,
    },
    #[error("query '{expr}' failed with API status '{status}'")]
    Failed { expr: String, status: String },
    #[error("unexpected query response shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// The typed portion of an instant-query response the proxy cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Vector(Vec<VectorSample>),
    /// Any other result type, carried by name only.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// `[timestamp, "value"]` as emitted by the API.
    pub value: (f64, String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

impl QueryApi {
    /// Bind a query client to a backend address, which must be an absolute
    /// `scheme://host[:port]` URL.
    pub fn new(client: reqwest::Client, address: &str) -> Result<Self, QueryError> {
        let base = Url::parse(address).map_err(|source| QueryError::Address {
            address: address.to_string(),
            source,
        })?;
        if !base.has_host() {
            return Err(QueryError::Address {
                address: address.to_string(),
                source: url::ParseError::EmptyHost,
            });
        }
        Ok(Self { base, client })
    }

    /// Execute `expr` as an instant query evaluated at `at`.
    pub async fn query(&self, expr: &str, at: SystemTime) -> Result<QueryValue, QueryError> {
        let url = self
            .base
            .join("/api/v1/query")
            .map_err(|source| QueryError::Address {
                address: self.base.to_string(),
                source,
            })?;
        let timestamp = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let response = self
            .client
            .get(url.clone())
            .query(&[("query", expr), ("time", &format!("{timestamp:.3}"))])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(QueryError::BadStatus {
                expr: expr.to_string(),
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: ApiResponse = response.json().await?;
        if body.status != "success" {
            return Err(QueryError::Failed {
                expr: expr.to_string(),
                status: body.status,
            });
        }
        let Some(data) = body.data else {
            return Err(QueryError::Failed {
                expr: expr.to_string(),
                status: "success (no data)".to_string(),
            });
        };
        match data.result_type.as_str() {
            "vector" => Ok(QueryValue::Vector(serde_json::from_value(data.result)?)),
            other => Ok(QueryValue::Other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const VECTOR_RESPONSE: &str = r#"{
        "status": "success",
        "data": {
            "resultType": "vector",
            "result": [
                {
                    "metric": {"__name__": "up", "instance": "1.2.3.4:9090", "job": "prometheus"},
                    "value": [1502134929.97, "1"]
                }
            ]
        }
    }"#;

    #[test]
    fn test_new_rejects_relative_addresses() {
        let client = reqwest::Client::new();
        assert!(matches!(
            QueryApi::new(client.clone(), "not a url"),
            Err(QueryError::Address { .. })
        ));
        assert!(matches!(
            QueryApi::new(client, "/just/a/path"),
            Err(QueryError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_parses_vector_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "up"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(VECTOR_RESPONSE, "application/json"),
            )
            .mount(&server)
            .await;

        let api = QueryApi::new(reqwest::Client::new(), &server.uri()).unwrap();
        let value = api.query("up", SystemTime::now()).await.unwrap();
        match value {
            QueryValue::Vector(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].value.1, "1");
                assert_eq!(samples[0].metric["job"], "prometheus");
            }
            other => panic!("expected vector result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_surfaces_api_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let api = QueryApi::new(reqwest::Client::new(), &server.uri()).unwrap();
        let err = api.query("up{", SystemTime::now()).await.unwrap_err();
        assert!(matches!(err, QueryError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_query_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let api = QueryApi::new(reqwest::Client::new(), &server.uri()).unwrap();
        let err = api.query("up", SystemTime::now()).await.unwrap_err();
        assert!(matches!(err, QueryError::BadStatus { status: 502, .. }));
    }
}
