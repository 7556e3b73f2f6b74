//! Dynamic routing of requests across the currently-selected backends.
//!
//! The router owns the live routing plane: an immutable snapshot pairing the
//! current selection with its rewriter, republished atomically by the single
//! serialized selection routine, and a buffering request front-end that
//! retries once on network failure, forcing a fresh selection on the way.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::locator::{Locator, PrometheusEndpoint};
use crate::selector::{Selector, SelectorError, SelectionResult, StrategyError};

pub mod affinity;
pub mod forward;
pub mod metrics;

use affinity::{AffinityOption, AffinityProvider, backend_of};
use forward::{Forwarder, is_network_error};
use metrics::RouterMetrics;

/// Pure closure rewriting a URL's scheme and host to the next chosen
/// backend; replaced atomically together with the selection it captures.
pub type Rewriter = Arc<dyn Fn(&mut Url) + Send + Sync>;

fn noop_rewriter() -> Rewriter {
    Arc::new(|_| {})
}

/// The selection and its rewriter, published as one immutable unit so no
/// request can observe fields from different rounds.
pub struct RoutingSnapshot {
    pub result: SelectionResult,
    pub(crate) rewriter: Rewriter,
}

/// Largest request body the buffering front-end will hold for replay.
const MAX_BUFFERED_BODY: usize = 32 * 1024 * 1024;

/// Header carrying the backend chosen for each response.
const SERVED_BY: HeaderName = HeaderName::from_static("mpp.servedby");

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("at least one locator must be configured")]
    NoLocators,
    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

/// A snapshot status summary of the router state.
#[derive(Debug, Clone)]
pub struct Status {
    pub endpoints: Vec<PrometheusEndpoint>,
    pub strategy: String,
    pub strategy_description: String,
    pub comparison_metric: String,
    pub affinity_options: String,
    pub interval: Duration,
}

pub struct Router {
    selector: Selector,
    state: RwLock<Arc<RoutingSnapshot>>,
    affinity: AffinityProvider,
    affinity_options: Vec<AffinityOption>,
    interval: Duration,
    metrics: RouterMetrics,
    forwarder: Forwarder,
    /// Single-slot token marking control of the selection process.
    the_conch: tokio::sync::Semaphore,
    /// Held for writing for the duration of a selection; late arrivals wait
    /// on the read side instead of running their own round.
    selection_gate: tokio::sync::RwLock<()>,
    shutdown: tokio::sync::mpsc::Sender<()>,
}

impl Router {
    /// Construct a router over the given locators, run one synchronous
    /// initial selection, and start the periodic reselection task.
    pub async fn new(
        interval: Duration,
        affinity_options: Vec<AffinityOption>,
        locators: Vec<Box<dyn Locator>>,
        strategy_args: &[String],
        client: reqwest::Client,
        metrics_namespace: &str,
    ) -> Result<Arc<Self>, RouterError> {
        if locators.is_empty() {
            return Err(RouterError::NoLocators);
        }
        let selector = Selector::new(&client, locators, strategy_args)?;
        if selector.strategy.requires_sticky_sessions() && affinity_options.is_empty() {
            warn!(
                strategy = %selector.strategy.name(),
                "strategy benefits from sticky sessions but no affinity options are enabled"
            );
        }
        let (shutdown, mut shutdown_rx) = tokio::sync::mpsc::channel(1);

        let router = Arc::new(Self {
            selector,
            state: RwLock::new(Arc::new(RoutingSnapshot {
                result: SelectionResult::default(),
                rewriter: noop_rewriter(),
            })),
            affinity: AffinityProvider::new(&affinity_options),
            affinity_options,
            interval,
            metrics: RouterMetrics::new(metrics_namespace),
            forwarder: Forwarder::new(client),
            the_conch: tokio::sync::Semaphore::new(1),
            selection_gate: tokio::sync::RwLock::new(()),
            shutdown,
        });

        router.do_selection().await;

        let periodic = Arc::clone(&router);
        tokio::spawn(async move {
            loop {
                debug!(interval = ?periodic.interval, "backend selection is sleeping");
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(periodic.interval) => periodic.do_selection().await,
                }
            }
        });

        Ok(router)
    }

    /// Stop the background selection task.
    pub fn close(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// The current (selection, rewriter) pair. Each request takes exactly
    /// one snapshot and works from it for the whole attempt.
    pub fn current(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.state.read().expect("routing snapshot poisoned"))
    }

    /// A status summary for the status page.
    pub fn status(&self) -> Status {
        let snapshot = self.current();
        Status {
            endpoints: snapshot.result.candidates.clone(),
            strategy: self.selector.strategy.name(),
            strategy_description: self.selector.strategy.description().to_string(),
            comparison_metric: self.selector.strategy.comparison_metric_name().to_string(),
            affinity_options: self
                .affinity_options
                .iter()
                .map(|option| option.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            interval: self.interval,
        }
    }

    /// Run one serialized selection round.
    ///
    /// At most one round executes at any instant: whoever takes the token
    /// runs the round; everyone else waits for the in-progress one to
    /// publish by touching the read side of the gate.
    pub async fn do_selection(&self) {
        match self.the_conch.try_acquire() {
            Ok(_permit) => {
                let _gate = self.selection_gate.write().await;
                debug!("got selection token; performing selection");
                self.reselect().await;
                debug!("returning selection token");
            }
            Err(_) => {
                warn!("Selection is already in-progress; awaiting result");
                drop(self.selection_gate.read().await);
            }
        }
    }

    async fn reselect(&self) {
        let (result, error) = self.selector.select().await;
        let selected = result.selection.len();

        if result.selection.is_empty() {
            match error {
                // No locator produced anything; the previous selection (if
                // any) keeps serving.
                Some(err @ SelectorError::NoCandidates) => {
                    error!(error = %err, "selector returned no candidates; keeping current selection");
                }
                Some(err) => {
                    error!(error = %err, "Selector returned no valid selection");
                    self.publish(RoutingSnapshot {
                        result,
                        rewriter: noop_rewriter(),
                    });
                }
                None => {
                    warn!("Selector returned no valid selection");
                    self.publish(RoutingSnapshot {
                        result,
                        rewriter: noop_rewriter(),
                    });
                }
            }
        } else {
            let current = self.current();
            let rewriter = if current.result.selection == result.selection {
                info!(selection = ?display_urls(&result.selection), "selection is unchanged");
                Arc::clone(&current.rewriter)
            } else {
                info!(
                    previous = ?display_urls(&current.result.selection),
                    selection = ?display_urls(&result.selection),
                    "new targets differ from current selection; updating rewriter"
                );
                let targets = result.selection.clone();
                let strategy = Arc::clone(&self.selector.strategy);
                Arc::new(move |url: &mut Url| {
                    let target = &targets[strategy.next_index(&targets)];
                    let _ = url.set_scheme(target.scheme());
                    let _ = url.set_host(target.host_str());
                    let _ = url.set_port(target.port());
                }) as Rewriter
            };
            self.publish(RoutingSnapshot { result, rewriter });
        }

        self.metrics.record_selected_backends(selected);
        self.metrics.record_selection_event();
    }

    fn publish(&self, snapshot: RoutingSnapshot) {
        *self.state.write().expect("routing snapshot poisoned") = Arc::new(snapshot);
    }

    /// Serve one request through the buffering front-end: the body is held
    /// for replay and a classified network error triggers a single retry
    /// through the inner handler.
    pub async fn serve(&self, request: Request) -> Response {
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
        };

        // The retry marker lives here, shared by both attempts: the first
        // attempt arms it so the second recognises itself as a retry.
        let mut is_retry = false;
        let mut last_backend: Option<Url> = None;

        match self
            .handle_attempt(&parts, body.clone(), client_ip, &mut is_retry, &mut last_backend)
            .await
        {
            Ok(response) => response,
            Err(err) if is_network_error(&err) => {
                warn!(error = %err, "network error talking to backend; retrying");
                match self
                    .handle_attempt(&parts, body, client_ip, &mut is_retry, &mut last_backend)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, "retry failed");
                        plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "failed to forward request");
                plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    /// One buffered attempt: retry accounting, affinity, rewrite, forward.
    async fn handle_attempt(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        client_ip: Option<std::net::IpAddr>,
        is_retry: &mut bool,
        last_backend: &mut Option<Url>,
    ) -> Result<Response, reqwest::Error> {
        if *is_retry {
            warn!("Backend selection forced by retry");
            if let Some(backend) = last_backend.as_ref() {
                self.metrics.record_retry(&backend_of(backend));
            }
            self.do_selection().await;
        } else {
            *is_retry = true;
        }

        let snapshot = self.current();
        let selection = &snapshot.result.selection;
        if selection.is_empty() {
            return Ok(plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "No backends available",
            ));
        }

        let preferred =
            self.affinity
                .preferred_target(&parts.headers, client_ip, selection, &self.metrics);
        let needs_cookie =
            self.affinity.cookies_enabled() && preferred.is_none() && selection.len() > 1;

        let mut url = match request_url(parts) {
            Some(url) => url,
            None => {
                return Ok(plain_response(StatusCode::BAD_REQUEST, "Unroutable request URI"));
            }
        };
        match &preferred {
            Some(target) => {
                debug!(target = %target, "reusing sticky session");
                let _ = url.set_scheme(target.scheme());
                let _ = url.set_host(target.host_str());
                let _ = url.set_port(target.port());
            }
            None => (snapshot.rewriter)(&mut url),
        }
        *last_backend = Some(url.clone());

        let backend = backend_of(&url);
        self.metrics.record_request(&backend);

        let started = Instant::now();
        let mut response = self.forwarder.forward(parts, body, &url, client_ip).await?;
        self.metrics.record_response_time(&backend, started.elapsed());

        if let Ok(value) = HeaderValue::from_str(&backend) {
            response.headers_mut().insert(SERVED_BY, value);
        }
        self.affinity.save_preferred_target(
            response.headers_mut(),
            &parts.headers,
            client_ip,
            &url,
            needs_cookie,
        );
        Ok(response)
    }
}

/// Build an absolute URL from the request's path and query; the placeholder
/// authority is always overwritten by affinity or the rewriter before use.
fn request_url(parts: &http::request::Parts) -> Option<Url> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://unrouted.invalid{path_and_query}")).ok()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn display_urls(urls: &[Url]) -> Vec<&str> {
    urls.iter().map(Url::as_str).collect()
}
