//! Instance lifecycle endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use gpufleet_core::proto::{
    ComprehensiveList, CreateInstanceRequest, CreateInstanceResponse, ListOpts, OperationResponse,
    SearchBy,
};
use gpufleet_core::types::InstanceState;

use crate::error::AppError;
use crate::router::AppState;

pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), AppError> {
    let response = state.orchestrator.create_instance(&request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_one(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceState>, AppError> {
    Ok(Json(state.orchestrator.get_instance(&id).await?))
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    Query(opts): Query<ListOpts>,
) -> Result<Json<ComprehensiveList>, AppError> {
    Ok(Json(
        state.orchestrator.list_instances_comprehensive(opts).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuery {
    #[serde(default)]
    pub search_by: Option<SearchBy>,
}

pub async fn start(
    Extension(state): Extension<Arc<AppState>>,
    Path(identifier): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<Json<OperationResponse>, AppError> {
    let search_by = query.search_by.unwrap_or_default();
    Ok(Json(
        state
            .orchestrator
            .start_instance(&identifier, search_by)
            .await?,
    ))
}

pub async fn stop(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>, AppError> {
    Ok(Json(state.orchestrator.stop_instance(&id).await?))
}
