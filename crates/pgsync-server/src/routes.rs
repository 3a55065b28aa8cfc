//! HTTP routes exposed by the controller.
//!
//! A single unauthenticated `GET /metrics` route, scraped by Prometheus.
//! Grounded on `zvault-server::routes::mounts`'s `Router<Arc<AppState>>` +
//! `State` extractor shape.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use pgsync_core::MetricsSink;

/// Builds the router serving `/metrics`.
#[must_use]
pub fn router() -> Router<Arc<MetricsSink>> {
    Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
}

async fn metrics(State(sink): State<Arc<MetricsSink>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        sink.render(),
    )
        .into_response()
}
