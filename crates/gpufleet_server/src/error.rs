//! Error handling for the axum surface.
//! Maps `FleetError` to HTTP status codes and the JSON error body contract:
//! `{code, message, timestamp, requestId}` plus `validationErrors[]` when
//! field-level reasons exist.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use gpufleet_core::error::FleetError;

/// Wrapper to convert `FleetError` into an axum response.
pub struct AppError(pub FleetError);

impl From<FleetError> for AppError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
            "timestamp": Utc::now(),
            "requestId": Uuid::new_v4().to_string(),
        });
        if let FleetError::Validation(errors) = &self.0 {
            body["validationErrors"] = json!(errors);
        }
        if let FleetError::NoOptimalProduct(failures) = &self.0 {
            body["regions"] = json!(failures);
        }
        (status, Json(body)).into_response()
    }
}
