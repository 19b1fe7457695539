//! Instance state store — the single source of truth for instance lifecycle.
//!
//! Keys: `instance:<id>` (body hash) and `instance:name:<name>` (name → id).
//! Every mutation goes through [`InstanceStateStore::update`], which holds a
//! per-instance critical section, stamps `last_updated_at`, and invalidates
//! the instance caches. Cross-process exclusion stays with the KV backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::cache::Cache;
use crate::error::FleetError;
use crate::ports::{KvBackend, Result};
use crate::proto::{ComprehensiveList, MergedInstance};
use crate::serialize;
use crate::types::{InstanceState, InstanceStatus, ProviderInstance};

/// Caches invalidated on every state write.
#[derive(Clone)]
pub struct StateCaches {
    pub details: Cache<InstanceState>,
    pub states: Cache<InstanceState>,
    pub merged: Cache<ComprehensiveList>,
}

pub struct InstanceStateStore {
    kv: Arc<dyn KvBackend>,
    namespace: String,
    caches: StateCaches,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceStateStore {
    pub fn new(kv: Arc<dyn KvBackend>, namespace: impl Into<String>, caches: StateCaches) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            caches,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn instance_key(&self, id: &str) -> String {
        format!("{}:instance:{id}", self.namespace)
    }

    fn name_key(&self, name: &str) -> String {
        format!("{}:instance:name:{name}", self.namespace)
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(id.to_string()).or_default().clone()
    }

    fn invalidate(&self, id: &str) {
        self.caches.details.delete(id);
        self.caches.states.delete(id);
        // Every merged variant is stale after any state write.
        self.caches.merged.invalidate_where(|_| true);
    }

    async fn save(&self, state: &InstanceState) -> Result<()> {
        let body = serialize::to_string(state)?;
        self.kv
            .hset(&self.instance_key(&state.id), "data", &body)
            .await
    }

    /// Persist a fresh record; the name must be unused.
    pub async fn create(&self, state: &InstanceState) -> Result<()> {
        let claimed = self
            .kv
            .set_nx(&self.name_key(&state.name), &state.id, None)
            .await?;
        if !claimed {
            return Err(FleetError::Conflict(format!(
                "instance name '{}' is already in use",
                state.name
            )));
        }
        self.save(state).await?;
        self.invalidate(&state.id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<InstanceState> {
        if let Some(hit) = self.caches.states.get(id) {
            return Ok(hit);
        }
        match self.kv.hget(&self.instance_key(id), "data").await? {
            Some(body) => {
                let state: InstanceState = serialize::from_str(&body)?;
                self.caches.states.set(id, state.clone());
                Ok(state)
            }
            None => Err(FleetError::NotFound(format!("instance {id}"))),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> Result<InstanceState> {
        match self.kv.get(&self.name_key(name)).await? {
            Some(id) => self.get(&id).await,
            None => Err(FleetError::NotFound(format!("instance named '{name}'"))),
        }
    }

    /// Find the local record shadowing a provider instance, if any.
    pub async fn find_by_upstream_id(&self, upstream_id: &str) -> Result<Option<InstanceState>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|s| s.upstream_id.as_deref() == Some(upstream_id)))
    }

    pub async fn list(&self) -> Result<Vec<InstanceState>> {
        let name_prefix = format!("{}:instance:name:", self.namespace);
        let keys = self
            .kv
            .keys(&format!("{}:instance:*", self.namespace))
            .await?;
        let mut out = Vec::new();
        for key in keys {
            if key.starts_with(&name_prefix) {
                continue;
            }
            if let Some(body) = self.kv.hget(&key, "data").await? {
                out.push(serialize::from_str(&body)?);
            }
        }
        out.sort_by(|a: &InstanceState, b: &InstanceState| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Apply `patch` to the current record under the per-instance critical
    /// section. A patch returning `Err` leaves the stored record unchanged.
    pub async fn update<F>(&self, id: &str, patch: F) -> Result<InstanceState>
    where
        F: FnOnce(&mut InstanceState) -> Result<()>,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Bypass the read cache under the lock; it may be a write behind.
        let body = self
            .kv
            .hget(&self.instance_key(id), "data")
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("instance {id}")))?;
        let mut state: InstanceState = serialize::from_str(&body)?;
        patch(&mut state)?;
        state.last_updated_at = Utc::now();
        self.save(&state).await?;
        self.invalidate(id);
        Ok(state)
    }

    /// Move the lifecycle forward; transitions outside the diagram are
    /// rejected with `InvalidTransition` and the record is left unchanged.
    pub async fn transition(&self, id: &str, to: InstanceStatus) -> Result<InstanceState> {
        self.update(id, |state| {
            if !state.status.can_transition(to) {
                return Err(FleetError::InvalidTransition {
                    from: state.status,
                    to,
                });
            }
            state.status = to;
            let now = Utc::now();
            match to {
                InstanceStatus::HealthChecking => state.started_at = Some(now),
                InstanceStatus::Ready => state.ready_at = Some(now),
                InstanceStatus::Exited => {
                    state.stopped_at = Some(now);
                    state.startup_operation_id = None;
                }
                InstanceStatus::Failed => state.failed_at = Some(now),
                _ => {}
            }
            Ok(())
        })
        .await
    }

    /// Delete a record and its name pointer.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let state = self.get(id).await?;
        self.kv.del(&self.name_key(&state.name)).await?;
        self.kv.del(&self.instance_key(id)).await?;
        self.locks.lock().unwrap().remove(id);
        self.invalidate(id);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.kv.ping().await
    }
}

// ── Merge ─────────────────────────────────────────────────────

/// Merge local records with the provider listing.
///
/// The provider is authoritative for lifecycle status, ports, and connection
/// details; local records contribute the local id, `webhook_url`, and health
/// check progress. Provider rows without a local shadow are included only
/// when `include_provider_only` is set.
pub fn merge_instances(
    local: &[InstanceState],
    provider: &[ProviderInstance],
    include_provider_only: bool,
) -> Vec<MergedInstance> {
    let by_upstream: HashMap<&str, &ProviderInstance> =
        provider.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut merged: Vec<MergedInstance> = Vec::new();
    for state in local {
        let upstream = state
            .upstream_id
            .as_deref()
            .and_then(|id| by_upstream.get(id).copied());
        merged.push(match upstream {
            Some(p) => MergedInstance {
                id: Some(state.id.clone()),
                upstream_id: Some(p.id.clone()),
                name: state.name.clone(),
                status: p.status.as_str().to_string(),
                ports: p.ports.clone(),
                connection: p.connection.clone(),
                webhook_url: state.webhook_url.clone(),
                health_check: state.health_check.clone(),
                local_only: false,
                provider_only: false,
            },
            None => MergedInstance {
                id: Some(state.id.clone()),
                upstream_id: state.upstream_id.clone(),
                name: state.name.clone(),
                status: state.status.as_str().to_lowercase(),
                ports: Vec::new(),
                connection: state.connection.clone(),
                webhook_url: state.webhook_url.clone(),
                health_check: state.health_check.clone(),
                local_only: false,
                provider_only: false,
            },
        });
    }

    if include_provider_only {
        let shadowed: std::collections::HashSet<&str> = local
            .iter()
            .filter_map(|s| s.upstream_id.as_deref())
            .collect();
        for p in provider.iter().filter(|p| !shadowed.contains(p.id.as_str())) {
            merged.push(MergedInstance {
                id: None,
                upstream_id: Some(p.id.clone()),
                name: p.name.clone(),
                status: p.status.as_str().to_string(),
                ports: p.ports.clone(),
                connection: p.connection.clone(),
                webhook_url: None,
                health_check: None,
                local_only: false,
                provider_only: true,
            });
        }
    }
    merged
}

/// Local-only rows for the provider-outage fallback path.
pub fn local_fallback_rows(local: &[InstanceState]) -> Vec<MergedInstance> {
    local
        .iter()
        .map(|state| MergedInstance {
            id: Some(state.id.clone()),
            upstream_id: state.upstream_id.clone(),
            name: state.name.clone(),
            status: state.status.as_str().to_lowercase(),
            ports: Vec::new(),
            connection: state.connection.clone(),
            webhook_url: state.webhook_url.clone(),
            health_check: state.health_check.clone(),
            local_only: true,
            provider_only: false,
        })
        .collect()
}
