//! Job model — typed units of deferred work flowing through the queue.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ProbeConfig, ProbeEndpoint, TemplateConfiguration};

/// Closed set of job types; one handler is registered per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    CreateInstance,
    MonitorStartup,
    MonitorInstance,
    HealthCheck,
    SendWebhook,
    MigrateBatch,
    MigrateInstance,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "CREATE_INSTANCE",
            Self::MonitorStartup => "MONITOR_STARTUP",
            Self::MonitorInstance => "MONITOR_INSTANCE",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::SendWebhook => "SEND_WEBHOOK",
            Self::MigrateBatch => "MIGRATE_BATCH",
            Self::MigrateInstance => "MIGRATE_INSTANCE",
        }
    }

    pub const ALL: [JobType; 7] = [
        Self::CreateInstance,
        Self::MonitorStartup,
        Self::MonitorInstance,
        Self::HealthCheck,
        Self::SendWebhook,
        Self::MigrateBatch,
        Self::MigrateInstance,
    ];
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Higher priority pops first; ties broken by `created_at` ascending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    /// Ordering weight; larger runs first.
    pub fn weight(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 5,
            Self::High => 10,
        }
    }
}

/// Direction a monitor job is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorTarget {
    /// Startup path: wait for the provider to report the instance running.
    Running,
    /// Stop path: wait for the provider to report the instance exited.
    Exited,
}

/// Type-specific job payloads — the stable wire contract between the API
/// layer and the workers. Unknown payloads fail deserialization, so they are
/// rejected at enqueue time by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    CreateInstance {
        instance_id: String,
        name: String,
        product_id: String,
        template: TemplateConfiguration,
        gpu_num: u32,
        rootfs_size: u32,
        region: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
    },
    MonitorStartup {
        instance_id: String,
        upstream_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
        start_time: DateTime<Utc>,
        max_wait_ms: u64,
    },
    MonitorInstance {
        instance_id: String,
        upstream_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
        start_time: DateTime<Utc>,
        max_wait_ms: u64,
        target: MonitorTarget,
    },
    HealthCheck {
        instance_id: String,
        endpoints: Vec<ProbeEndpoint>,
        config: ProbeConfig,
    },
    SendWebhook {
        url: String,
        payload: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret_id: Option<String>,
    },
    MigrateBatch {
        tick_bucket: String,
    },
    MigrateInstance {
        upstream_id: String,
        reason: String,
    },
}

impl JobPayload {
    /// The queue a payload belongs to.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::CreateInstance { .. } => JobType::CreateInstance,
            Self::MonitorStartup { .. } => JobType::MonitorStartup,
            Self::MonitorInstance { .. } => JobType::MonitorInstance,
            Self::HealthCheck { .. } => JobType::HealthCheck,
            Self::SendWebhook { .. } => JobType::SendWebhook,
            Self::MigrateBatch { .. } => JobType::MigrateBatch,
            Self::MigrateInstance { .. } => JobType::MigrateInstance,
        }
    }
}

/// Unit of deferred work persisted in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Caller-chosen dedup token; the pointer it names is released when the
    /// job reaches a final status.
    pub idempotency_key: Option<String>,
}

impl Job {
    pub fn new(payload: JobPayload, priority: JobPriority, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: payload.job_type(),
            payload,
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            next_retry_at: None,
            error: None,
            lease_expires_at: None,
            idempotency_key: None,
        }
    }
}

// ── Retry backoff ─────────────────────────────────────────────

/// Backoff shape shared by the queue and the provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Delay before attempt `attempt + 1`, given `attempt` failures so far
/// (1-indexed): `min(max_delay, base · 2^(attempt-1))` plus uniform jitter
/// in `[0, max_jitter]`.
pub fn retry_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    use rand::Rng;

    let pow = attempt.saturating_sub(1).min(20);
    let exponential = config.base_delay.saturating_mul(2_u32.saturating_pow(pow));
    let capped = exponential.min(config.max_delay);
    let jitter_ms = if config.max_jitter.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.max_jitter.as_millis() as u64)
    };
    capped + Duration::from_millis(jitter_ms)
}
