//! Orchestrator — the public operations consumed by the HTTP layer.
//!
//! Thin coordinator: validates input, resolves product + template, writes the
//! initial instance record, and enqueues background work. Callers are
//! synchronous only up to the enqueue point; lifecycle completion is
//! signalled via webhook.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::error::FleetError;
use crate::job::{JobPayload, JobPriority};
use crate::ports::{ProviderApi, Result};
use crate::proto::{
    ComprehensiveList, CreateInstanceRequest, CreateInstanceResponse, ListCounts, ListOpts,
    ListPerformance, OperationResponse, SearchBy,
};
use crate::queue::{EnqueueOpts, JobQueue};
use crate::selector::ProductSelector;
use crate::state::{local_fallback_rows, merge_instances, InstanceStateStore, StateCaches};
use crate::template::TemplateResolver;
use crate::types::{InstanceListQuery, InstanceState, InstanceStatus, RegionConfig};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub regions: Vec<RegionConfig>,
    /// Optimistic readiness estimate returned from create/start.
    pub estimated_ready: Duration,
    /// Envelope for startup/stop monitoring before the instance is failed.
    pub monitor_max_wait: Duration,
    pub enable_fallback_to_local: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            estimated_ready: Duration::from_secs(300),
            monitor_max_wait: Duration::from_secs(600),
            enable_fallback_to_local: true,
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ProviderApi>,
    queue: Arc<JobQueue>,
    store: Arc<InstanceStateStore>,
    selector: ProductSelector,
    templates: TemplateResolver,
    caches: StateCaches,
    cfg: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        queue: Arc<JobQueue>,
        store: Arc<InstanceStateStore>,
        selector: ProductSelector,
        templates: TemplateResolver,
        caches: StateCaches,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            queue,
            store,
            selector,
            templates,
            caches,
            cfg,
        }
    }

    /// Validate, pick the cheapest region/product, resolve the template,
    /// persist the initial record, and enqueue the creation job.
    pub async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse> {
        req.validate()?;

        let optimal = self
            .selector
            .optimal_product_with_fallback(
                &req.product_name,
                req.region.as_deref(),
                &self.cfg.regions,
            )
            .await?;
        let template_id = req.template_id.normalized();
        let template_config = self.templates.get_template_configuration(&template_id).await?;

        let instance_id = Uuid::new_v4().to_string();
        let mut state = InstanceState::new(
            &instance_id,
            &req.name,
            &optimal.product.id,
            &optimal.region_used,
            &template_id,
            req.gpu_num_or_default(),
            req.rootfs_size_or_default(),
        );
        state.ports = template_config.template.ports.clone();
        state.envs = template_config.template.envs.clone();
        state.webhook_url = req.webhook_url.clone();
        self.store.create(&state).await?;

        self.queue
            .enqueue(
                JobPayload::CreateInstance {
                    instance_id: instance_id.clone(),
                    name: req.name.clone(),
                    product_id: optimal.product.id.clone(),
                    template: template_config,
                    gpu_num: state.gpu_num,
                    rootfs_size: state.rootfs_size,
                    region: optimal.region_used.clone(),
                    webhook_url: req.webhook_url.clone(),
                },
                EnqueueOpts {
                    priority: JobPriority::Normal,
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(instance_id = %instance_id, region = %optimal.region_used, "instance creation accepted");
        Ok(CreateInstanceResponse {
            instance_id,
            status: InstanceStatus::Creating,
            estimated_ready_at: Utc::now()
                + chrono::Duration::from_std(self.cfg.estimated_ready).unwrap_or_default(),
        })
    }

    /// Read one instance, refreshing connection details from the provider
    /// when an upstream instance exists. Provider outages degrade to the
    /// local record.
    pub async fn get_instance(&self, id: &str) -> Result<InstanceState> {
        if let Some(hit) = self.caches.details.get(id) {
            return Ok(hit);
        }
        let state = self.store.get(id).await?;
        let state = match &state.upstream_id {
            Some(upstream_id) => match self.provider.get_instance(upstream_id).await {
                Ok(remote) => {
                    self.store
                        .update(id, |s| {
                            s.connection = remote.connection.clone();
                            Ok(())
                        })
                        .await?
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "provider refresh failed; serving local record");
                    state
                }
            },
            None => state,
        };
        self.caches.details.set(id, state.clone());
        Ok(state)
    }

    /// Merged local + provider listing with caching and timing breakdown.
    pub async fn list_instances_comprehensive(
        &self,
        opts: ListOpts,
    ) -> Result<ComprehensiveList> {
        let cache_key = opts.cache_key();
        if let Some(mut hit) = self.caches.merged.get(&cache_key) {
            hit.performance.cache_hit = true;
            return Ok(hit);
        }

        let total_start = Instant::now();
        let local_fut = async {
            let start = Instant::now();
            (self.store.list().await, start.elapsed())
        };
        let upstream_fut = async {
            let start = Instant::now();
            (
                self.provider
                    .list_instances(&InstanceListQuery::default())
                    .await,
                start.elapsed(),
            )
        };
        let ((local, local_elapsed), (upstream, upstream_elapsed)) =
            tokio::join!(local_fut, upstream_fut);
        let local = local?;

        let (items, upstream_count) = match upstream {
            Ok(remote) => {
                if opts.sync_local_state {
                    self.sync_local_state(&local, &remote).await?;
                }
                (
                    merge_instances(&local, &remote, opts.include_novita_only),
                    remote.len(),
                )
            }
            Err(e) if self.cfg.enable_fallback_to_local => {
                tracing::warn!(error = %e, "provider listing failed; falling back to local records");
                (local_fallback_rows(&local), 0)
            }
            Err(e) => return Err(e),
        };

        let list = ComprehensiveList {
            counts: ListCounts {
                local: local.len(),
                upstream: upstream_count,
                merged: items.len(),
            },
            performance: ListPerformance {
                total_ms: total_start.elapsed().as_millis() as u64,
                upstream_ms: upstream_elapsed.as_millis() as u64,
                local_ms: local_elapsed.as_millis() as u64,
                cache_hit: false,
            },
            items,
        };
        self.caches.merged.set(cache_key, list.clone());
        Ok(list)
    }

    /// Persist provider-authoritative fields back into shadowed local rows.
    /// Lifecycle status is only written when the mapped transition is legal;
    /// connection details always sync.
    async fn sync_local_state(
        &self,
        local: &[InstanceState],
        remote: &[crate::types::ProviderInstance],
    ) -> Result<()> {
        for state in local {
            let Some(upstream_id) = state.upstream_id.as_deref() else {
                continue;
            };
            let Some(remote_row) = remote.iter().find(|r| r.id == upstream_id) else {
                continue;
            };
            let connection = remote_row.connection.clone();
            self.store
                .update(&state.id, move |s| {
                    if connection.is_some() {
                        s.connection = connection;
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn resolve(&self, identifier: &str, search_by: SearchBy) -> Result<InstanceState> {
        match search_by {
            SearchBy::Id => self.store.get(identifier).await,
            SearchBy::Name => self.store.get_by_name(identifier).await,
            SearchBy::Auto => match self.store.get(identifier).await {
                Ok(state) => Ok(state),
                Err(FleetError::NotFound(_)) => self.store.get_by_name(identifier).await,
                Err(e) => Err(e),
            },
        }
    }

    /// Start an exited instance: claim a startup operation, start upstream,
    /// move to `Starting`, and enqueue the monitor.
    pub async fn start_instance(
        &self,
        identifier: &str,
        search_by: SearchBy,
    ) -> Result<OperationResponse> {
        let state = self.resolve(identifier, search_by).await?;
        let id = state.id.clone();
        let upstream_id = state
            .upstream_id
            .clone()
            .ok_or_else(|| FleetError::Conflict(format!("instance {id} has no upstream instance")))?;

        let operation_id = Uuid::new_v4().to_string();
        // Claim first so concurrent starts collapse to one operation.
        let op = operation_id.clone();
        self.store
            .update(&id, move |s| {
                if s.startup_operation_id.is_some() {
                    return Err(FleetError::Conflict(
                        "a startup operation is already in flight".into(),
                    ));
                }
                if !s.status.can_transition(InstanceStatus::Starting) {
                    return Err(FleetError::InvalidTransition {
                        from: s.status,
                        to: InstanceStatus::Starting,
                    });
                }
                s.startup_operation_id = Some(op);
                Ok(())
            })
            .await?;

        if let Err(e) = self.provider.start_instance(&upstream_id).await {
            // Release the claim; the instance stays where it was.
            self.store
                .update(&id, |s| {
                    s.startup_operation_id = None;
                    s.last_error = Some(e.to_string());
                    Ok(())
                })
                .await?;
            return Err(e);
        }

        self.store.transition(&id, InstanceStatus::Starting).await?;
        self.queue
            .enqueue(
                JobPayload::MonitorStartup {
                    instance_id: id,
                    upstream_id,
                    webhook_url: state.webhook_url.clone(),
                    start_time: Utc::now(),
                    max_wait_ms: self.cfg.monitor_max_wait.as_millis() as u64,
                },
                EnqueueOpts::default(),
            )
            .await?;

        Ok(OperationResponse {
            operation_id,
            status: InstanceStatus::Starting,
            estimated_ready_at: Utc::now()
                + chrono::Duration::from_std(self.cfg.estimated_ready).unwrap_or_default(),
        })
    }

    /// Stop a ready instance and monitor it down to `Exited`.
    pub async fn stop_instance(&self, id: &str) -> Result<OperationResponse> {
        let state = self.store.get(id).await?;
        let upstream_id = state
            .upstream_id
            .clone()
            .ok_or_else(|| FleetError::Conflict(format!("instance {id} has no upstream instance")))?;
        if !state.status.can_transition(InstanceStatus::Stopping) {
            return Err(FleetError::InvalidTransition {
                from: state.status,
                to: InstanceStatus::Stopping,
            });
        }

        self.provider.stop_instance(&upstream_id).await?;
        self.store.transition(id, InstanceStatus::Stopping).await?;

        let operation_id = Uuid::new_v4().to_string();
        self.queue
            .enqueue(
                JobPayload::MonitorInstance {
                    instance_id: id.to_string(),
                    upstream_id,
                    webhook_url: state.webhook_url.clone(),
                    start_time: Utc::now(),
                    max_wait_ms: self.cfg.monitor_max_wait.as_millis() as u64,
                    target: crate::job::MonitorTarget::Exited,
                },
                EnqueueOpts::default(),
            )
            .await?;

        Ok(OperationResponse {
            operation_id,
            status: InstanceStatus::Stopping,
            estimated_ready_at: Utc::now()
                + chrono::Duration::from_std(self.cfg.estimated_ready).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cache::Cache;
    use crate::job::JobType;
    use crate::kv::MemoryBackend;
    use crate::proto::TemplateId;
    use crate::queue::QueueConfig;
    use crate::stub::{http_port, StubProvider};
    use crate::types::{EnvVar, Product, ProviderInstanceStatus, Template};

    struct Fixture {
        orchestrator: Orchestrator,
        provider: Arc<StubProvider>,
        queue: Arc<JobQueue>,
        store: Arc<InstanceStateStore>,
    }

    fn caches() -> StateCaches {
        StateCaches {
            details: Cache::new("instance-details", 64, Duration::from_secs(30)),
            states: Cache::new("instance-states", 64, Duration::from_secs(60)),
            merged: Cache::new("merged-instances", 16, Duration::from_secs(60)),
        }
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(StubProvider::new());
        provider.add_products(
            "r1",
            vec![Product {
                id: "cheap".into(),
                name: "RTX-4090".into(),
                region: "eu-01".into(),
                spot_price_usd_per_hour: 1.5,
                availability: true,
            }],
        );
        provider.add_template(Template {
            id: "tpl-42".into(),
            image_url: "https://registry.example.com/gpu/base:latest".into(),
            image_auth_id: None,
            ports: vec![http_port(8888)],
            envs: vec![EnvVar {
                key: "MODEL".into(),
                value: "llama".into(),
            }],
        });

        let kv = Arc::new(MemoryBackend::new());
        let queue = Arc::new(JobQueue::new(kv.clone(), QueueConfig::default()));
        let caches = caches();
        let store = Arc::new(InstanceStateStore::new(kv, "test", caches.clone()));
        let selector = ProductSelector::new(
            provider.clone(),
            Cache::new("products", 32, Duration::from_secs(300)),
            Cache::new("optimal-products", 32, Duration::from_secs(300)),
        );
        let templates = TemplateResolver::new(
            provider.clone(),
            Cache::new("templates", 32, Duration::from_secs(600)),
        );
        let cfg = OrchestratorConfig {
            regions: vec![RegionConfig {
                id: "r1".into(),
                name: "eu-01".into(),
                priority: 1,
            }],
            ..Default::default()
        };
        Fixture {
            orchestrator: Orchestrator::new(
                provider.clone(),
                queue.clone(),
                store.clone(),
                selector,
                templates,
                caches,
                cfg,
            ),
            provider,
            queue,
            store,
        }
    }

    fn create_request(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.into(),
            product_name: "RTX-4090".into(),
            template_id: TemplateId::Text("tpl-42".into()),
            gpu_num: None,
            rootfs_size: None,
            region: None,
            webhook_url: Some("https://hooks.example.com/x".into()),
        }
    }

    #[tokio::test]
    async fn create_writes_record_and_enqueues_job() {
        let f = fixture();
        let resp = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        assert_eq!(resp.status, InstanceStatus::Creating);

        let state = f.store.get(&resp.instance_id).await.unwrap();
        assert_eq!(state.name, "gpu-1");
        assert_eq!(state.region, "eu-01");
        assert_eq!(state.product_id, "cheap");
        assert_eq!(state.ports.len(), 1);

        let job = f
            .queue
            .pop(JobType::CreateInstance, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("creation job queued");
        let JobPayload::CreateInstance { instance_id, region, .. } = job.payload else {
            panic!("wrong payload");
        };
        assert_eq!(instance_id, resp.instance_id);
        assert_eq!(region, "eu-01");
    }

    #[tokio::test]
    async fn invalid_request_enqueues_nothing() {
        let f = fixture();
        let mut req = create_request("bad name!");
        req.product_name = "".into();
        assert!(matches!(
            f.orchestrator.create_instance(&req).await,
            Err(FleetError::Validation(_))
        ));
        assert!(f
            .queue
            .pop(JobType::CreateInstance, Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        assert!(f.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let f = fixture();
        f.orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        let err = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[tokio::test]
    async fn start_requires_exited_status() {
        let f = fixture();
        let resp = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        // Still CREATING: the lifecycle rejects a start.
        let err = f
            .orchestrator
            .start_instance(&resp.instance_id, SearchBy::Id)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[tokio::test]
    async fn start_from_exited_enqueues_monitor_and_sets_operation() {
        let f = fixture();
        let resp = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        let id = resp.instance_id.clone();

        // Walk the record into EXITED with a live upstream instance.
        let upstream = f
            .provider
            .create_instance(&crate::types::CreateInstanceSpec {
                name: "gpu-1".into(),
                product_id: "cheap".into(),
                gpu_num: 1,
                rootfs_size: 60,
                image_url: "https://registry.example.com/gpu/base:latest".into(),
                image_auth: None,
                ports: vec![http_port(8888)],
                envs: vec![],
            })
            .await
            .unwrap();
        f.store
            .update(&id, |s| {
                s.upstream_id = Some(upstream.id.clone());
                s.status = InstanceStatus::Exited;
                Ok(())
            })
            .await
            .unwrap();

        let op = f
            .orchestrator
            .start_instance(&id, SearchBy::Auto)
            .await
            .unwrap();
        assert_eq!(op.status, InstanceStatus::Starting);

        let state = f.store.get(&id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Starting);
        assert_eq!(state.startup_operation_id.as_deref(), Some(op.operation_id.as_str()));

        let job = f
            .queue
            .pop(JobType::MonitorStartup, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("monitor job queued");
        assert!(matches!(job.payload, JobPayload::MonitorStartup { .. }));

        // A second start while the operation is live conflicts.
        let err = f
            .orchestrator
            .start_instance(&id, SearchBy::Id)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[tokio::test]
    async fn start_resolves_by_name() {
        let f = fixture();
        let resp = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        f.store
            .update(&resp.instance_id, |s| {
                s.upstream_id = Some("up-x".into());
                s.status = InstanceStatus::Exited;
                Ok(())
            })
            .await
            .unwrap();
        f.provider.put_instance(crate::types::ProviderInstance {
            id: "up-x".into(),
            name: "gpu-1".into(),
            status: ProviderInstanceStatus::Exited,
            ports: vec![],
            connection: None,
            reclaim_flagged: false,
            reclaim_reason: None,
        });

        let op = f
            .orchestrator
            .start_instance("gpu-1", SearchBy::Name)
            .await
            .unwrap();
        assert_eq!(op.status, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn comprehensive_list_merges_and_caches() {
        let f = fixture();
        let resp = f
            .orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        f.store
            .update(&resp.instance_id, |s| {
                s.upstream_id = Some("up-50".into());
                Ok(())
            })
            .await
            .unwrap();
        f.provider.put_instance(crate::types::ProviderInstance {
            id: "up-50".into(),
            name: "gpu-1".into(),
            status: ProviderInstanceStatus::Running,
            ports: vec![],
            connection: None,
            reclaim_flagged: false,
            reclaim_reason: None,
        });

        let first = f
            .orchestrator
            .list_instances_comprehensive(ListOpts::default())
            .await
            .unwrap();
        assert_eq!(first.counts.merged, 1);
        assert_eq!(first.items[0].status, "running");
        assert!(!first.performance.cache_hit);

        let second = f
            .orchestrator
            .list_instances_comprehensive(ListOpts::default())
            .await
            .unwrap();
        assert!(second.performance.cache_hit);
    }

    #[tokio::test]
    async fn comprehensive_list_falls_back_to_local_on_provider_outage() {
        let f = fixture();
        f.orchestrator
            .create_instance(&create_request("gpu-1"))
            .await
            .unwrap();
        *f.provider.list_failure.lock().unwrap() = Some(503);

        let list = f
            .orchestrator
            .list_instances_comprehensive(ListOpts::default())
            .await
            .unwrap();
        assert_eq!(list.counts.upstream, 0);
        assert_eq!(list.items.len(), 1);
        assert!(list.items[0].local_only);
    }

    #[tokio::test]
    async fn queue_pause_mask_is_exposed() {
        // The backpressure hook the scheduler drives.
        let f = fixture();
        f.queue
            .set_pause_mask(HashSet::from([JobType::SendWebhook]))
            .await;
        assert!(f.queue.is_paused(JobType::SendWebhook).await);
    }
}
