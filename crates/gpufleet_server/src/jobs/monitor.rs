//! `MONITOR_STARTUP` / `MONITOR_INSTANCE` — poll the provider until the
//! instance reaches the awaited lifecycle point, then hand off.
//!
//! Polling is a job chain: each poll that is not yet conclusive re-enqueues
//! a delayed copy of itself, bounded by the `max_wait_ms` envelope carried
//! in the payload.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobPayload, MonitorTarget};
use gpufleet_core::queue::EnqueueOpts;
use gpufleet_core::types::{InstanceStatus, ProviderInstanceStatus};

use crate::dispatcher::JobHandler;
use crate::jobs::JobContext;

pub struct MonitorHandler {
    ctx: Arc<JobContext>,
}

impl MonitorHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

struct MonitorArgs {
    instance_id: String,
    upstream_id: String,
    webhook_url: Option<String>,
    start_time: DateTime<Utc>,
    max_wait_ms: u64,
    target: MonitorTarget,
}

fn parse(job: &Job) -> Result<MonitorArgs, FleetError> {
    match &job.payload {
        JobPayload::MonitorStartup {
            instance_id,
            upstream_id,
            webhook_url,
            start_time,
            max_wait_ms,
        } => Ok(MonitorArgs {
            instance_id: instance_id.clone(),
            upstream_id: upstream_id.clone(),
            webhook_url: webhook_url.clone(),
            start_time: *start_time,
            max_wait_ms: *max_wait_ms,
            target: MonitorTarget::Running,
        }),
        JobPayload::MonitorInstance {
            instance_id,
            upstream_id,
            webhook_url,
            start_time,
            max_wait_ms,
            target,
        } => Ok(MonitorArgs {
            instance_id: instance_id.clone(),
            upstream_id: upstream_id.clone(),
            webhook_url: webhook_url.clone(),
            start_time: *start_time,
            max_wait_ms: *max_wait_ms,
            target: *target,
        }),
        other => Err(FleetError::Serialization(format!(
            "monitor handler received {} payload",
            other.job_type()
        ))),
    }
}

#[async_trait]
impl JobHandler for MonitorHandler {
    async fn execute(&self, job: &Job) -> Result<(), FleetError> {
        let args = parse(job)?;

        let elapsed_ms = (Utc::now() - args.start_time).num_milliseconds().max(0) as u64;
        if elapsed_ms > args.max_wait_ms {
            self.ctx
                .fail_instance(
                    &args.instance_id,
                    args.webhook_url.as_deref(),
                    &format!(
                        "instance did not reach the awaited state within {} ms",
                        args.max_wait_ms
                    ),
                )
                .await?;
            return Ok(());
        }

        let remote = self.ctx.provider.get_instance(&args.upstream_id).await?;

        match (remote.status.clone(), args.target) {
            (ProviderInstanceStatus::Running, MonitorTarget::Running) => {
                let connection = remote.connection.clone();
                self.ctx
                    .store
                    .update(&args.instance_id, move |s| {
                        if connection.is_some() {
                            s.connection = connection;
                        }
                        Ok(())
                    })
                    .await?;
                self.ctx
                    .store
                    .transition(&args.instance_id, InstanceStatus::HealthChecking)
                    .await?;

                let endpoints = remote.probe_endpoints();
                if endpoints.is_empty() {
                    // Nothing to probe: readiness is vacuous.
                    self.ctx
                        .store
                        .transition(&args.instance_id, InstanceStatus::Ready)
                        .await?;
                    self.ctx
                        .enqueue_event_webhook(
                            args.webhook_url.as_deref(),
                            gpufleet_core::proto::WebhookEventKind::InstanceReady,
                            &args.instance_id,
                            Some(&args.upstream_id),
                            serde_json::json!({ "probedEndpoints": 0 }),
                        )
                        .await?;
                } else {
                    self.ctx
                        .queue
                        .enqueue(
                            JobPayload::HealthCheck {
                                instance_id: args.instance_id.clone(),
                                endpoints,
                                config: self.ctx.probe_config.clone(),
                            },
                            EnqueueOpts::default(),
                        )
                        .await?;
                }
                Ok(())
            }
            (ProviderInstanceStatus::Exited, MonitorTarget::Exited) => {
                self.ctx
                    .store
                    .transition(&args.instance_id, InstanceStatus::Exited)
                    .await?;
                Ok(())
            }
            (status, _) if status.is_failure() => {
                self.ctx
                    .fail_instance(
                        &args.instance_id,
                        args.webhook_url.as_deref(),
                        &format!("provider reported instance {} as failed", args.upstream_id),
                    )
                    .await?;
                Ok(())
            }
            _ => {
                // Not conclusive yet: poll again after the configured delay.
                self.re_enqueue(&args).await?;
                Ok(())
            }
        }
    }
}

impl MonitorHandler {
    async fn re_enqueue(&self, args: &MonitorArgs) -> Result<(), FleetError> {
        let payload = match args.target {
            MonitorTarget::Running => JobPayload::MonitorStartup {
                instance_id: args.instance_id.clone(),
                upstream_id: args.upstream_id.clone(),
                webhook_url: args.webhook_url.clone(),
                start_time: args.start_time,
                max_wait_ms: args.max_wait_ms,
            },
            MonitorTarget::Exited => JobPayload::MonitorInstance {
                instance_id: args.instance_id.clone(),
                upstream_id: args.upstream_id.clone(),
                webhook_url: args.webhook_url.clone(),
                start_time: args.start_time,
                max_wait_ms: args.max_wait_ms,
                target: args.target,
            },
        };
        self.ctx
            .queue
            .enqueue(
                payload,
                EnqueueOpts {
                    delay: Some(self.ctx.poll_interval),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
