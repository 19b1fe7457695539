//! `MIGRATE_BATCH` and `MIGRATE_INSTANCE` handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobPayload};
use gpufleet_core::proto::WebhookEventKind;
use gpufleet_core::queue::EnqueueOpts;
use gpufleet_core::types::InstanceStatus;

use crate::dispatcher::JobHandler;
use crate::jobs::{final_attempt, JobContext};
use crate::migration::run_batch_scan;

pub struct MigrateBatchHandler {
    ctx: Arc<JobContext>,
}

impl MigrateBatchHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for MigrateBatchHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let JobPayload::MigrateBatch { tick_bucket } = &job.payload else {
            return Err(FleetError::Serialization(format!(
                "migrate batch handler received {} payload",
                job.job_type
            )));
        };
        let metrics = run_batch_scan(&self.ctx).await?;
        tracing::debug!(tick_bucket, enqueued = metrics.enqueued, "batch scan complete");
        Ok(())
    }
}

pub struct MigrateInstanceHandler {
    ctx: Arc<JobContext>,
}

impl MigrateInstanceHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for MigrateInstanceHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let JobPayload::MigrateInstance {
            upstream_id,
            reason,
        } = &job.payload
        else {
            return Err(FleetError::Serialization(format!(
                "migrate handler received {} payload",
                job.job_type
            )));
        };

        // The local shadow, if we manage this instance.
        let local = self.ctx.store.find_by_upstream_id(upstream_id).await?;
        if let Some(state) = &local {
            if state.status != InstanceStatus::Migrating {
                self.ctx
                    .store
                    .transition(&state.id, InstanceStatus::Migrating)
                    .await?;
            }
        }

        let replacement = match self.ctx.provider.migrate_instance(upstream_id).await {
            Ok(replacement) => replacement,
            Err(e) => {
                let retryable = self.ctx.migration.retry_failed && e.is_retryable();
                if let Some(state) = &local {
                    if !retryable || final_attempt(job) {
                        self.ctx
                            .fail_instance(
                                &state.id,
                                state.webhook_url.as_deref(),
                                &format!("migration failed: {e}"),
                            )
                            .await?;
                    }
                }
                return if retryable {
                    Err(e)
                } else {
                    // Force a terminal nack even for transient categories.
                    Err(FleetError::Internal(anyhow::anyhow!(
                        "migration of {upstream_id} failed: {e}"
                    )))
                };
            }
        };

        tracing::info!(
            from = %upstream_id,
            to = %replacement.id,
            reason,
            "instance migrated"
        );

        if let Some(state) = &local {
            let new_upstream = replacement.id.clone();
            self.ctx
                .store
                .update(&state.id, move |s| {
                    s.upstream_id = Some(new_upstream);
                    Ok(())
                })
                .await?;
            // Follow the replacement through its startup.
            self.ctx
                .store
                .transition(&state.id, InstanceStatus::Starting)
                .await?;
            self.ctx
                .queue
                .enqueue(
                    JobPayload::MonitorStartup {
                        instance_id: state.id.clone(),
                        upstream_id: replacement.id.clone(),
                        webhook_url: state.webhook_url.clone(),
                        start_time: Utc::now(),
                        max_wait_ms: self.ctx.monitor_max_wait.as_millis() as u64,
                    },
                    EnqueueOpts::default(),
                )
                .await?;
            self.ctx
                .enqueue_event_webhook(
                    state.webhook_url.as_deref(),
                    WebhookEventKind::InstanceMigrated,
                    &state.id,
                    Some(&replacement.id),
                    serde_json::json!({
                        "from": upstream_id,
                        "to": replacement.id,
                        "reason": reason,
                    }),
                )
                .await?;
        }
        Ok(())
    }
}
