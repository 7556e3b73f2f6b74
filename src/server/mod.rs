//! HTTP handler shell: the `/mpp/*` self-surface plus the proxy fallback.
//!
//! Everything that is not health, metrics, or status is handed to the
//! router and forwarded to a selected backend.

use std::sync::Arc;
use std::time::Instant;

use axum::Router as AxumRouter;
use axum::extract::{Request, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use http::{StatusCode, header};
use tower_http::trace::TraceLayer;

use crate::observability::metrics::render_metrics;
use crate::router::Router;

pub mod status_page;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub started_at: Instant,
}

/// Build the top-level application.
pub fn app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/mpp/health", get(health))
        .route("/mpp/metrics", get(metrics_exposition))
        .route("/mpp/status", get(status))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_exposition() -> Response {
    match render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Html<String> {
    Html(status_page::render(
        &state.router.status(),
        state.started_at.elapsed(),
    ))
}

async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    state.router.serve(request).await
}
