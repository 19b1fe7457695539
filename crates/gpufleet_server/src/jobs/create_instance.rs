//! `CREATE_INSTANCE` — call the provider, record the upstream id, hand off
//! to startup monitoring.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobPayload};
use gpufleet_core::queue::EnqueueOpts;
use gpufleet_core::types::{CreateInstanceSpec, InstanceStatus};

use crate::dispatcher::JobHandler;
use crate::jobs::{final_attempt, JobContext};

pub struct CreateInstanceHandler {
    ctx: Arc<JobContext>,
}

impl CreateInstanceHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for CreateInstanceHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let JobPayload::CreateInstance {
            instance_id,
            name,
            product_id,
            template,
            gpu_num,
            rootfs_size,
            webhook_url,
            ..
        } = &job.payload
        else {
            return Err(FleetError::Serialization(format!(
                "create handler received {} payload",
                job.job_type
            )));
        };

        let spec = CreateInstanceSpec {
            name: name.clone(),
            product_id: product_id.clone(),
            gpu_num: *gpu_num,
            rootfs_size: *rootfs_size,
            image_url: template.template.image_url.clone(),
            image_auth: template.image_auth.clone(),
            ports: template.template.ports.clone(),
            envs: template.template.envs.clone(),
        };

        let created = match self.ctx.provider.create_instance(&spec).await {
            Ok(created) => created,
            Err(e) => {
                if !e.is_retryable() || final_attempt(job) {
                    self.ctx
                        .fail_instance(instance_id, webhook_url.as_deref(), &e.to_string())
                        .await?;
                }
                return Err(e);
            }
        };

        let upstream_id = created.id.clone();
        self.ctx
            .store
            .update(instance_id, {
                let upstream_id = upstream_id.clone();
                move |s| {
                    s.upstream_id = Some(upstream_id);
                    Ok(())
                }
            })
            .await?;
        self.ctx
            .store
            .transition(instance_id, InstanceStatus::Starting)
            .await?;

        self.ctx
            .queue
            .enqueue(
                JobPayload::MonitorStartup {
                    instance_id: instance_id.clone(),
                    upstream_id,
                    webhook_url: webhook_url.clone(),
                    start_time: Utc::now(),
                    max_wait_ms: self.ctx.monitor_max_wait.as_millis() as u64,
                },
                EnqueueOpts::default(),
            )
            .await?;
        Ok(())
    }
}
