//! Request forwarding to a selected backend.
//!
//! The forwarder replays a buffered request against the chosen backend and
//! streams the backend's response body straight through. Hop-by-hop headers
//! are stripped in both directions.

use std::net::IpAddr;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

/// Headers scoped to a single connection, never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Replay the buffered request against `target`, appending the client to
    /// the forwarded-for chain, and stream the backend response back.
    pub async fn forward(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        target: &Url,
        client_ip: Option<IpAddr>,
    ) -> Result<Response, reqwest::Error> {
        let mut headers = forwardable_headers(&parts.headers);
        if let Some(ip) = client_ip {
            if let Ok(value) = HeaderValue::from_str(&forwarded_for(&parts.headers, ip)) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let upstream = self
            .client
            .request(parts.method.clone(), target.clone())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwardable_headers(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Classify errors that warrant a transparent retry: connection failures,
/// timeouts, and requests that died before producing a response. Backend
/// HTTP error statuses are not errors here at all; they are proxied.
pub fn is_network_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    // Host and content-length are recomputed for the upstream request.
    HOP_BY_HOP.contains(&name.as_str())
        || *name == http::header::HOST
        || *name == http::header::CONTENT_LENGTH
}

fn forwarded_for(headers: &HeaderMap, client_ip: IpAddr) -> String {
    match headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        Some(chain) if !chain.is_empty() => format!("{chain}, {client_ip}"),
        _ => client_ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request_parts(uri: &str) -> http::request::Parts {
        let (parts, _) = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .header("connection", "keep-alive")
            .header("accept", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn test_forward_strips_hop_by_hop_and_appends_forwarded_for() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(header("accept", "application/json"))
            .and(header("x-forwarded-for", "10.1.1.1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(reqwest::Client::new());
        let parts = request_parts("/api/v1/query");
        let target = Url::parse(&format!("{}/api/v1/query", server.uri())).unwrap();

        let response = forwarder
            .forward(&parts, Bytes::new(), &target, Some("10.1.1.1".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_network_error() {
        let forwarder = Forwarder::new(reqwest::Client::new());
        let parts = request_parts("/");
        let target = Url::parse("http://127.0.0.1:1/").unwrap();

        let err = forwarder
            .forward(&parts, Bytes::new(), &target, None)
            .await
            .unwrap_err();
        assert!(is_network_error(&err));
    }

    #[tokio::test]
    async fn test_backend_5xx_is_proxied_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(reqwest::Client::new());
        let parts = request_parts("/");
        let target = Url::parse(&server.uri()).unwrap();

        let response = forwarder
            .forward(&parts, Bytes::new(), &target, None)
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
    }

    #[test]
    fn test_forwarded_for_appends_to_an_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let chain = forwarded_for(&headers, "10.0.0.2".parse().unwrap());
        assert_eq!(chain, "10.0.0.1, 10.0.0.2");
    }
}
