//! Dependency health endpoint — 200 when everything answers, 503 otherwise.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::Extension, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::router::AppState;

async fn service_status(
    check: impl std::future::Future<Output = gpufleet_core::Result<()>>,
) -> (bool, Value) {
    let started = Instant::now();
    match check.await {
        Ok(()) => (
            true,
            json!({"status": "up", "latencyMs": started.elapsed().as_millis() as u64}),
        ),
        Err(e) => (
            false,
            json!({"status": "down", "error": e.to_string()}),
        ),
    }
}

pub async fn health(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    let (upstream_ok, upstream) = service_status(state.provider.ping()).await;
    let (queue_ok, queue) = service_status(state.queue.ping()).await;
    // The in-process cache registry cannot go down; report its footprint.
    let cache = json!({
        "status": "up",
        "caches": state.caches.stats().len(),
    });

    let healthy = upstream_ok && queue_ok;
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "services": {
            "upstream": upstream,
            "queue": queue,
            "cache": cache,
        },
        "performance": {
            "uptimeSec": state.metrics.uptime().as_secs(),
        },
        "uptime": state.metrics.uptime().as_secs(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
