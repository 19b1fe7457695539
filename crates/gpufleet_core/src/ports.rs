//! Port traits — implemented by gpufleet_redis and gpufleet_provider.
//! Core logic depends only on these traits, never on redis or reqwest.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::types::{
    CreateInstanceSpec, InstanceListQuery, Product, ProductQuery, ProviderInstance, RegistryAuth,
    Template,
};

pub type Result<T> = std::result::Result<T, FleetError>;

/// Narrow interface over the external key/value + sorted-set store.
///
/// All mutual exclusion between workers flows through these atomic
/// operations; values are strings produced by [`crate::serialize`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Atomic set-if-absent. Returns `true` when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn lpush(&self, key: &str, value: &str) -> Result<u64>;
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<u64>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Atomically pop the member with the lowest score.
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn ping(&self) -> Result<()>;
}

/// Typed operations against the upstream GPU provider.
///
/// Implementations carry the cross-cutting behavior (deadline, retry with
/// backoff, circuit breaker, error categorization); callers see only the
/// domain types and the §7 error taxonomy.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn list_products(&self, query: &ProductQuery) -> Result<Vec<Product>>;
    async fn get_template(&self, template_id: &str) -> Result<Template>;
    /// Resolve a stored registry credential by id; `NotFound` if absent.
    async fn get_registry_auth(&self, auth_id: &str) -> Result<RegistryAuth>;
    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<ProviderInstance>;
    async fn start_instance(&self, upstream_id: &str) -> Result<()>;
    async fn stop_instance(&self, upstream_id: &str) -> Result<()>;
    async fn get_instance(&self, upstream_id: &str) -> Result<ProviderInstance>;
    async fn list_instances(&self, query: &InstanceListQuery) -> Result<Vec<ProviderInstance>>;
    /// Migrate a reclaim-flagged instance; returns the replacement instance.
    async fn migrate_instance(&self, upstream_id: &str) -> Result<ProviderInstance>;
    /// Cheap reachability check used by the health endpoint.
    async fn ping(&self) -> Result<()>;
}
