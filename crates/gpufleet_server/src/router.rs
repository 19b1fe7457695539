//! Router construction and shared application state.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Extension, MatchedPath, Request},
    middleware::{self as axum_mw, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use gpufleet_core::cache::CacheRegistry;
use gpufleet_core::metrics::MetricsRegistry;
use gpufleet_core::ports::ProviderApi;
use gpufleet_core::queue::JobQueue;
use gpufleet_core::service::Orchestrator;
use gpufleet_core::state::InstanceStateStore;

use crate::handlers;

/// Everything the handlers need, behind one `Extension`.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<MetricsRegistry>,
    pub caches: Arc<CacheRegistry>,
    pub queue: Arc<JobQueue>,
    pub store: Arc<InstanceStateStore>,
    pub provider: Arc<dyn ProviderApi>,
}

/// Record per-endpoint request metrics keyed by the matched route template.
async fn track_metrics(
    Extension(state): Extension<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| format!("{} {}", request.method(), p.as_str()))
        .unwrap_or_else(|| format!("{} <unmatched>", request.method()));
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .record_request(&endpoint, response.status().as_u16(), started.elapsed());
    response
}

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/instances", post(handlers::instances::create))
        .route("/instances", get(handlers::instances::list))
        .route("/instances/:id", get(handlers::instances::get_one))
        .route("/instances/:id/start", post(handlers::instances::start))
        .route("/instances/:id/stop", post(handlers::instances::stop))
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::metrics::snapshot))
        .route("/cache/stats", get(handlers::cache_admin::stats))
        .route("/cache/clear", post(handlers::cache_admin::clear))
        .route("/cache/cleanup", post(handlers::cache_admin::cleanup))
        .layer(axum_mw::from_fn(track_metrics))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
