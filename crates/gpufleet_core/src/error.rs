//! Error taxonomy for the control plane.
//!
//! Every subsystem boundary returns `FleetError`; the HTTP layer maps it to a
//! status code via [`FleetError::http_status`] and the job worker classifies
//! retryability via [`FleetError::is_retryable`].

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::InstanceStatus;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("validation failed: {} error(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited by upstream")]
    RateLimit { retry_after: Option<Duration> },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("upstream rejected request ({status}): {message}")]
    Upstream4xx { status: u16, message: String },

    #[error("upstream failure ({status}): {message}")]
    Upstream5xx { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("kv backend unavailable: {0}")]
    KvUnavailable(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no optimal product in any region ({} tried)", .0.len())]
    NoOptimalProduct(Vec<RegionFailure>),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    /// HTTP status the public API surfaces for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) | Self::NoOptimalProduct(_) => 404,
            Self::Timeout(_) => 408,
            Self::InvalidTransition { .. } | Self::Conflict(_) => 409,
            Self::RateLimit { .. } => 429,
            Self::Upstream4xx { status, .. } => *status,
            Self::Upstream5xx { .. } => 502,
            Self::CircuitOpen(_) | Self::Network(_) | Self::KvUnavailable(_) => 503,
            Self::Configuration(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code carried in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimit { .. } => "RATE_LIMIT",
            Self::Timeout(_) => "TIMEOUT",
            Self::CircuitOpen(_) => "CIRCUIT_BREAKER_OPEN",
            Self::Upstream4xx { .. } => "UPSTREAM_4XX",
            Self::Upstream5xx { .. } => "UPSTREAM_5XX",
            Self::Network(_) => "NETWORK",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Serialization(_) => "SERIALIZATION",
            Self::KvUnavailable(_) => "KV_UNAVAILABLE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Conflict(_) => "CONFLICT",
            Self::NoOptimalProduct(_) => "NO_OPTIMAL_PRODUCT_ANY_REGION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a failed job carrying this error should be retried.
    ///
    /// Transient categories (rate limit, timeout, open breaker, upstream 5xx,
    /// network, kv outage) are retryable; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::Timeout(_)
                | Self::CircuitOpen(_)
                | Self::Upstream5xx { .. }
                | Self::Network(_)
                | Self::KvUnavailable(_)
        )
    }
}

/// Field-level reason inside a `Validation` error.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Per-region failure note accumulated by the product selector.
#[derive(Debug, Clone, Serialize)]
pub struct RegionFailure {
    pub region: String,
    pub reason: String,
}

impl std::fmt::Display for RegionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.region, self.reason)
    }
}
