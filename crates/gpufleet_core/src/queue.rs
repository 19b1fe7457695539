//! Durable job queue over the KV port.
//!
//! Layout per namespace:
//!   `job:<id>`            hash  — serialized job body (field `data`)
//!   `jobs:ready:<TYPE>`   zset  — ready index, scored (priority desc, created asc)
//!   `jobs:scheduled`      zset  — retries/delayed jobs, scored by next_retry_at
//!   `jobs:processing`     zset  — `TYPE|id` members scored by lease_expires_at
//!   `jobs:completed`      zset  — finished ids scored by completion time
//!   `jobs:failed`         zset  — dead ids scored by failure time
//!   `jobs:idem:<key>`     str   — idempotency pointer to a live job id
//!
//! At-most-one processing rests on the backend's atomic `zpopmin`; everything
//! else is plain reads/writes over the owned job body.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::FleetError;
use crate::job::{retry_delay, BackoffConfig, Job, JobPayload, JobPriority, JobStatus, JobType};
use crate::ports::{KvBackend, Result};
use crate::serialize;

/// Spread between priority bands in the ready index. Must dwarf any
/// realistic `created_at` millisecond timestamp delta within a band.
const PRIORITY_SPAN: f64 = 1.0e13;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub namespace: String,
    pub backoff: BackoffConfig,
    /// Completed/failed jobs older than this are garbage-collected.
    pub retention: Duration,
    /// Idempotency pointers expire on their own after this long as a
    /// backstop against orphaned pointers.
    pub idempotency_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "gpufleet".into(),
            backoff: BackoffConfig::default(),
            retention: Duration::from_secs(24 * 3600),
            idempotency_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub priority: JobPriority,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
    /// Land in the scheduled index instead of ready; promoted when due.
    pub delay: Option<Duration>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Counts surfaced by `stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub ready_by_type: HashMap<String, u64>,
    pub processing_by_type: HashMap<String, u64>,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total_backlog(&self) -> u64 {
        self.ready_by_type.values().sum::<u64>() + self.scheduled
    }
}

pub struct JobQueue {
    kv: Arc<dyn KvBackend>,
    cfg: QueueConfig,
    paused: RwLock<HashSet<JobType>>,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn KvBackend>, cfg: QueueConfig) -> Self {
        Self {
            kv,
            cfg,
            paused: RwLock::new(HashSet::new()),
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{id}", self.cfg.namespace)
    }

    fn ready_key(&self, job_type: JobType) -> String {
        format!("{}:jobs:ready:{job_type}", self.cfg.namespace)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:jobs:scheduled", self.cfg.namespace)
    }

    fn processing_key(&self) -> String {
        format!("{}:jobs:processing", self.cfg.namespace)
    }

    fn completed_key(&self) -> String {
        format!("{}:jobs:completed", self.cfg.namespace)
    }

    fn failed_key(&self) -> String {
        format!("{}:jobs:failed", self.cfg.namespace)
    }

    fn idem_key(&self, key: &str) -> String {
        format!("{}:jobs:idem:{key}", self.cfg.namespace)
    }

    fn ready_score(priority: JobPriority, created_at: DateTime<Utc>) -> f64 {
        created_at.timestamp_millis() as f64 - priority.weight() as f64 * PRIORITY_SPAN
    }

    fn processing_member(job_type: JobType, id: &str) -> String {
        format!("{job_type}|{id}")
    }

    fn split_processing_member(member: &str) -> Option<(&str, &str)> {
        member.split_once('|')
    }

    async fn save(&self, job: &Job) -> Result<()> {
        let body = serialize::to_string(job)?;
        self.kv.hset(&self.job_key(&job.id), "data", &body).await
    }

    /// The live job a dedup key currently points at, if any.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        match self.kv.get(&self.idem_key(key)).await? {
            Some(id) => match self.load(&id).await {
                Ok(job) => Ok(Some(job)),
                Err(FleetError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// Load a job body; `NotFound` if the id is unknown or already swept.
    pub async fn load(&self, id: &str) -> Result<Job> {
        match self.kv.hget(&self.job_key(id), "data").await? {
            Some(body) => serialize::from_str(&body),
            None => Err(FleetError::NotFound(format!("job {id}"))),
        }
    }

    /// Enqueue a payload; duplicate live idempotency keys collapse to the
    /// existing job, which is returned unchanged.
    pub async fn enqueue(&self, payload: JobPayload, opts: EnqueueOpts) -> Result<Job> {
        let mut job = Job::new(
            payload,
            opts.priority,
            opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        );
        job.idempotency_key = opts.idempotency_key.clone();

        if let Some(key) = &opts.idempotency_key {
            let pointer = self.idem_key(key);
            let claimed = self
                .kv
                .set_nx(&pointer, &job.id, Some(self.cfg.idempotency_ttl))
                .await?;
            if !claimed {
                if let Some(existing_id) = self.kv.get(&pointer).await? {
                    match self.load(&existing_id).await {
                        Ok(existing) => return Ok(existing),
                        // Pointer outlived its job body; reclaim it.
                        Err(FleetError::NotFound(_)) => {
                            self.kv
                                .set(&pointer, &job.id, Some(self.cfg.idempotency_ttl))
                                .await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        match opts.delay {
            Some(delay) => {
                let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                job.next_retry_at = Some(due);
                self.save(&job).await?;
                self.kv
                    .zadd(
                        &self.scheduled_key(),
                        due.timestamp_millis() as f64,
                        &job.id,
                    )
                    .await?;
            }
            None => {
                self.save(&job).await?;
                self.kv
                    .zadd(
                        &self.ready_key(job.job_type),
                        Self::ready_score(job.priority, job.created_at),
                        &job.id,
                    )
                    .await?;
            }
        }
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "enqueued job");
        Ok(job)
    }

    /// Atomically claim the highest-priority ready job of `job_type` with a
    /// lease of `lease`. `None` when the queue is empty or the type paused.
    pub async fn pop(&self, job_type: JobType, lease: Duration) -> Result<Option<Job>> {
        if self.paused.read().await.contains(&job_type) {
            return Ok(None);
        }
        let ready = self.ready_key(job_type);
        loop {
            let Some((id, _)) = self.kv.zpopmin(&ready).await? else {
                return Ok(None);
            };
            let mut job = match self.load(&id).await {
                Ok(job) => job,
                // Body swept while indexed; skip to the next candidate.
                Err(FleetError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let now = Utc::now();
            job.status = JobStatus::Processing;
            job.processed_at = Some(now);
            // Attempts count claims; a claim that later nacks or loses its
            // lease has already been paid for here.
            job.attempts += 1;
            let lease_expires =
                now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
            job.lease_expires_at = Some(lease_expires);
            self.save(&job).await?;
            self.kv
                .zadd(
                    &self.processing_key(),
                    lease_expires.timestamp_millis() as f64,
                    &Self::processing_member(job_type, &id),
                )
                .await?;
            return Ok(Some(job));
        }
    }

    /// Mark a processing job completed.
    pub async fn ack(&self, id: &str) -> Result<Job> {
        let mut job = self.load(id).await?;
        self.kv
            .zrem(
                &self.processing_key(),
                &Self::processing_member(job.job_type, id),
            )
            .await?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.lease_expires_at = None;
        self.save(&job).await?;
        self.kv
            .zadd(
                &self.completed_key(),
                Utc::now().timestamp_millis() as f64,
                id,
            )
            .await?;
        self.release_idempotency(&job).await?;
        Ok(job)
    }

    /// Record a handler failure for the attempt counted at pop time.
    /// Retryable failures below the attempt cap are rescheduled with capped
    /// exponential backoff + jitter; everything else goes to `Failed`.
    pub async fn nack(&self, id: &str, error: &str, retryable: bool) -> Result<Job> {
        let mut job = self.load(id).await?;
        self.kv
            .zrem(
                &self.processing_key(),
                &Self::processing_member(job.job_type, id),
            )
            .await?;
        job.error = Some(error.to_string());
        job.lease_expires_at = None;

        if retryable && job.attempts < job.max_attempts {
            let delay = retry_delay(&self.cfg.backoff, job.attempts);
            let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            job.status = JobStatus::Pending;
            job.next_retry_at = Some(due);
            self.save(&job).await?;
            self.kv
                .zadd(&self.scheduled_key(), due.timestamp_millis() as f64, id)
                .await?;
            tracing::debug!(job_id = %id, attempts = job.attempts, delay_ms = delay.as_millis() as u64, "job rescheduled");
        } else {
            self.fail(&mut job).await?;
            tracing::warn!(job_id = %id, attempts = job.attempts, error, "job failed terminally");
        }
        Ok(job)
    }

    async fn fail(&self, job: &mut Job) -> Result<()> {
        job.status = JobStatus::Failed;
        job.next_retry_at = None;
        self.save(job).await?;
        self.kv
            .zadd(
                &self.failed_key(),
                Utc::now().timestamp_millis() as f64,
                &job.id,
            )
            .await?;
        self.release_idempotency(job).await
    }

    async fn release_idempotency(&self, job: &Job) -> Result<()> {
        if let Some(key) = &job.idempotency_key {
            // Only release a pointer that still names this job.
            let pointer = self.idem_key(key);
            if self.kv.get(&pointer).await?.as_deref() == Some(job.id.as_str()) {
                self.kv.del(&pointer).await?;
            }
        }
        Ok(())
    }

    /// Move scheduled jobs whose retry time has arrived back to ready.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .kv
            .zrange_by_score(
                &self.scheduled_key(),
                f64::MIN,
                now.timestamp_millis() as f64,
                None,
            )
            .await?;
        let mut promoted = 0;
        for id in due {
            let mut job = match self.load(&id).await {
                Ok(job) => job,
                Err(FleetError::NotFound(_)) => {
                    self.kv.zrem(&self.scheduled_key(), &id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            job.next_retry_at = None;
            self.save(&job).await?;
            self.kv
                .zadd(
                    &self.ready_key(job.job_type),
                    Self::ready_score(job.priority, job.created_at),
                    &id,
                )
                .await?;
            self.kv.zrem(&self.scheduled_key(), &id).await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Return jobs with expired leases to the ready index, counting the lost
    /// lease as an attempt. Jobs out of attempts go to `Failed` instead.
    pub async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .kv
            .zrange_by_score(
                &self.processing_key(),
                f64::MIN,
                now.timestamp_millis() as f64,
                None,
            )
            .await?;
        let mut reclaimed = 0;
        for member in expired {
            let Some((_, id)) = Self::split_processing_member(&member) else {
                self.kv.zrem(&self.processing_key(), &member).await?;
                continue;
            };
            let mut job = match self.load(id).await {
                Ok(job) => job,
                Err(FleetError::NotFound(_)) => {
                    self.kv.zrem(&self.processing_key(), &member).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.kv.zrem(&self.processing_key(), &member).await?;
            // An implicit nack: the claim that lost its lease was already
            // counted in `attempts` at pop time.
            job.lease_expires_at = None;
            job.error = Some("lease expired".into());
            if job.attempts >= job.max_attempts {
                self.fail(&mut job).await?;
            } else {
                job.status = JobStatus::Pending;
                self.save(&job).await?;
                self.kv
                    .zadd(
                        &self.ready_key(job.job_type),
                        Self::ready_score(job.priority, job.created_at),
                        id,
                    )
                    .await?;
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Number of in-flight jobs of one type — the counter the migration
    /// scheduler bounds itself with.
    pub async fn processing_count(&self, job_type: JobType) -> Result<u64> {
        let members = self.kv.zrevrange(&self.processing_key(), 0, -1).await?;
        let prefix = format!("{job_type}|");
        Ok(members.iter().filter(|m| m.starts_with(&prefix)).count() as u64)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            scheduled: self.kv.zcard(&self.scheduled_key()).await?,
            completed: self.kv.zcard(&self.completed_key()).await?,
            failed: self.kv.zcard(&self.failed_key()).await?,
            ..Default::default()
        };
        for job_type in JobType::ALL {
            let ready = self.kv.zcard(&self.ready_key(job_type)).await?;
            if ready > 0 {
                stats
                    .ready_by_type
                    .insert(job_type.as_str().to_string(), ready);
            }
        }
        for member in self.kv.zrevrange(&self.processing_key(), 0, -1).await? {
            if let Some((type_str, _)) = Self::split_processing_member(&member) {
                *stats
                    .processing_by_type
                    .entry(type_str.to_string())
                    .or_default() += 1;
            }
        }
        Ok(stats)
    }

    /// Drop completed/failed jobs older than the retention window.
    pub async fn cleanup_retention(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            - chrono::Duration::from_std(self.cfg.retention).unwrap_or(chrono::Duration::zero());
        let cutoff_ms = cutoff.timestamp_millis() as f64;
        let mut removed = 0;
        for key in [self.completed_key(), self.failed_key()] {
            let victims = self
                .kv
                .zrange_by_score(&key, f64::MIN, cutoff_ms, None)
                .await?;
            for id in &victims {
                self.kv.del(&self.job_key(id)).await?;
            }
            self.kv.zrem_range_by_score(&key, f64::MIN, cutoff_ms).await?;
            removed += victims.len();
        }
        Ok(removed)
    }

    /// Replace the pause mask; paused types are skipped by `pop`.
    pub async fn set_pause_mask(&self, mask: HashSet<JobType>) {
        *self.paused.write().await = mask;
    }

    pub async fn is_paused(&self, job_type: JobType) -> bool {
        self.paused.read().await.contains(&job_type)
    }

    pub async fn ping(&self) -> Result<()> {
        self.kv.ping().await
    }
}
