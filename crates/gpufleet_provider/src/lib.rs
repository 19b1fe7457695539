//! gpufleet_provider — reqwest adapter for the upstream GPU provider API.
//!
//! Implements `gpufleet_core::ports::ProviderApi` with the cross-cutting
//! behavior the rest of the control plane relies on: per-call deadlines,
//! retries with capped exponential backoff + jitter, rate-limit awareness,
//! a per-endpoint-group circuit breaker, and error categorization into the
//! domain taxonomy. Credentials never appear in logs or error messages.

pub mod breaker;
pub mod client;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use client::{NovitaClient, ProviderConfig};
