//! `SEND_WEBHOOK` — one delivery attempt batch, outcome mapped to ack/nack.

use std::sync::Arc;

use async_trait::async_trait;

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobPayload};

use crate::dispatcher::JobHandler;
use crate::jobs::JobContext;
use crate::webhook::DeliveryOutcome;

pub struct SendWebhookHandler {
    ctx: Arc<JobContext>,
}

impl SendWebhookHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for SendWebhookHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let JobPayload::SendWebhook {
            url,
            payload,
            headers,
            ..
        } = &job.payload
        else {
            return Err(FleetError::Serialization(format!(
                "webhook handler received {} payload",
                job.job_type
            )));
        };

        // The job id doubles as the receiver-side idempotency token, so
        // queue-level retries of the same delivery share one X-Request-Id.
        match self
            .ctx
            .webhooks
            .deliver(url, payload, &job.id, headers.as_ref())
            .await
        {
            DeliveryOutcome::Delivered => Ok(()),
            DeliveryOutcome::Retryable { reason } => Err(FleetError::Network(reason)),
            DeliveryOutcome::Terminal { status, reason } => Err(FleetError::Upstream4xx {
                status: if status == 0 { 400 } else { status },
                message: reason,
            }),
        }
    }
}
