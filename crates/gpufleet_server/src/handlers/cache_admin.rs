//! Administrative cache endpoints.

use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::{json, Value};

use crate::router::AppState;

pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "caches": state.caches.stats() }))
}

pub async fn clear(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    state.caches.clear_all();
    Json(json!({"cleared": true}))
}

pub async fn cleanup(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let removed = state.caches.cleanup_all();
    Json(json!({"removedExpired": removed}))
}
