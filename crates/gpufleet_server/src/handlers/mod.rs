//! HTTP handlers, one module per resource.

pub mod cache_admin;
pub mod health;
pub mod instances;
pub mod metrics;
