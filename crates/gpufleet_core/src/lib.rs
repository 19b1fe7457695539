//! gpufleet_core — pure domain for the GPU instance control plane.
//!
//! Domain types, the error taxonomy, port traits, and the orchestration
//! substrate (job queue, instance state store, product selector, template
//! resolver, orchestrator service). Core logic depends only on the port
//! traits in [`ports`] — never on redis, reqwest, or axum directly.

pub mod cache;
pub mod error;
pub mod job;
pub mod kv;
pub mod metrics;
pub mod ports;
pub mod proto;
pub mod queue;
pub mod selector;
pub mod serialize;
pub mod service;
pub mod state;
#[cfg(any(test, feature = "test-util"))]
pub mod stub;
pub mod template;
pub mod types;

pub use error::FleetError;
pub use ports::Result;
