//! `HEALTH_CHECK` — run the readiness prober and settle the instance.

use std::sync::Arc;

use async_trait::async_trait;

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobPayload};
use gpufleet_core::proto::WebhookEventKind;
use gpufleet_core::state::InstanceStateStore;
use gpufleet_core::types::{HealthCheckProgress, InstanceStatus};

use crate::dispatcher::JobHandler;
use crate::jobs::JobContext;
use crate::probe::ProbeProgress;

pub struct HealthCheckHandler {
    ctx: Arc<JobContext>,
}

impl HealthCheckHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

/// Streams per-endpoint progress into `InstanceState.health_check`.
struct StoreProgress {
    store: Arc<InstanceStateStore>,
    instance_id: String,
}

#[async_trait]
impl ProbeProgress for StoreProgress {
    async fn update(&self, progress: HealthCheckProgress) {
        let result = self
            .store
            .update(&self.instance_id, move |s| {
                s.health_check = Some(progress);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(instance_id = %self.instance_id, error = %e, "failed to record probe progress");
        }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let JobPayload::HealthCheck {
            instance_id,
            endpoints,
            config,
        } = &job.payload
        else {
            return Err(FleetError::Serialization(format!(
                "health check handler received {} payload",
                job.job_type
            )));
        };

        let progress = Arc::new(StoreProgress {
            store: Arc::clone(&self.ctx.store),
            instance_id: instance_id.clone(),
        });
        let report = self
            .ctx
            .prober
            .probe_all(endpoints, config, progress)
            .await;

        let state = self.ctx.store.get(instance_id).await?;
        if report.ready {
            self.ctx
                .store
                .transition(instance_id, InstanceStatus::Ready)
                .await?;
            self.ctx
                .enqueue_event_webhook(
                    state.webhook_url.as_deref(),
                    WebhookEventKind::InstanceReady,
                    instance_id,
                    state.upstream_id.as_deref(),
                    serde_json::json!({ "probedEndpoints": report.endpoints.len() }),
                )
                .await?;
            tracing::info!(instance_id, "instance is ready");
        } else {
            let reason = report
                .first_failure()
                .unwrap_or_else(|| "health probes failed".into());
            self.ctx
                .fail_instance(instance_id, state.webhook_url.as_deref(), &reason)
                .await?;
        }
        Ok(())
    }
}
