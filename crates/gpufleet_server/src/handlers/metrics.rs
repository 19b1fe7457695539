//! Metrics registry snapshot.

use std::sync::Arc;

use axum::{extract::Extension, Json};

use gpufleet_core::metrics::MetricsSnapshot;

use crate::router::AppState;

pub async fn snapshot(Extension(state): Extension<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot(state.caches.stats()))
}
