//! Typed job handlers executed by the dispatcher.

pub mod create_instance;
pub mod health_check;
pub mod migrate;
pub mod monitor;
pub mod send_webhook;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use gpufleet_core::job::{Job, JobPayload};
use gpufleet_core::ports::{ProviderApi, Result};
use gpufleet_core::proto::{WebhookEvent, WebhookEventKind};
use gpufleet_core::queue::{EnqueueOpts, JobQueue};
use gpufleet_core::state::InstanceStateStore;
use gpufleet_core::types::ProbeConfig;

use crate::migration::MigrationConfig;
use crate::probe::ReadinessProber;
use crate::webhook::WebhookDeliverer;

pub use create_instance::CreateInstanceHandler;
pub use health_check::HealthCheckHandler;
pub use migrate::{MigrateBatchHandler, MigrateInstanceHandler};
pub use monitor::MonitorHandler;
pub use send_webhook::SendWebhookHandler;

/// Shared dependencies for every handler.
pub struct JobContext {
    pub provider: Arc<dyn ProviderApi>,
    pub queue: Arc<JobQueue>,
    pub store: Arc<InstanceStateStore>,
    pub webhooks: Arc<WebhookDeliverer>,
    pub prober: Arc<ReadinessProber>,
    pub probe_config: ProbeConfig,
    /// Delay between monitor polls.
    pub poll_interval: Duration,
    /// Envelope a monitor chain may spend before failing the instance.
    pub monitor_max_wait: Duration,
    pub migration: MigrationConfig,
}

/// True when this execution is the job's last allowed attempt (the current
/// claim is already counted in `attempts`): a retryable error now still ends
/// in `Failed`, so side effects (instance state, failure webhook) must happen
/// before returning it.
pub fn final_attempt(job: &Job) -> bool {
    job.attempts >= job.max_attempts
}

impl JobContext {
    /// Queue an event webhook for a caller that registered one.
    pub async fn enqueue_event_webhook(
        &self,
        webhook_url: Option<&str>,
        event: WebhookEventKind,
        instance_id: &str,
        upstream_id: Option<&str>,
        details: serde_json::Value,
    ) -> Result<()> {
        let Some(url) = webhook_url else {
            return Ok(());
        };
        let body = WebhookEvent {
            event,
            instance_id: instance_id.to_string(),
            upstream_id: upstream_id.map(String::from),
            timestamp: Utc::now(),
            details,
        };
        self.queue
            .enqueue(
                JobPayload::SendWebhook {
                    url: url.to_string(),
                    payload: serde_json::to_value(&body)
                        .map_err(|e| gpufleet_core::FleetError::Serialization(e.to_string()))?,
                    headers: None,
                    secret_id: None,
                },
                EnqueueOpts::default(),
            )
            .await?;
        Ok(())
    }

    /// Flip an instance to `FAILED`, record the error, and queue the failure
    /// webhook. Tolerates records already in a settled state.
    pub async fn fail_instance(
        &self,
        instance_id: &str,
        webhook_url: Option<&str>,
        error: &str,
    ) -> Result<()> {
        let error_text = error.to_string();
        let updated = self
            .store
            .update(instance_id, move |s| {
                s.last_error = Some(error_text);
                Ok(())
            })
            .await?;

        match self
            .store
            .transition(instance_id, gpufleet_core::types::InstanceStatus::Failed)
            .await
        {
            Ok(_) => {}
            Err(gpufleet_core::FleetError::InvalidTransition { from, .. }) => {
                // Already settled (e.g. FAILED twice via racing monitors).
                tracing::debug!(instance_id, %from, "skip failure transition from settled state");
            }
            Err(e) => return Err(e),
        }

        self.enqueue_event_webhook(
            webhook_url,
            WebhookEventKind::InstanceFailed,
            instance_id,
            updated.upstream_id.as_deref(),
            serde_json::json!({ "error": error }),
        )
        .await
    }
}
