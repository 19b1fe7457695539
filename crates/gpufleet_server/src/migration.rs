//! Migration scheduler — periodic scan for reclaim-flagged spot instances.
//!
//! Each tick enqueues a single `MIGRATE_BATCH` job deduplicated on the tick
//! bucket, so overlapping schedulers (or a fast restart) never run two scans
//! at once. The batch handler does the actual scan via [`run_batch_scan`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use gpufleet_core::job::{JobPayload, JobPriority, JobType};
use gpufleet_core::ports::Result;
use gpufleet_core::queue::{EnqueueOpts, JobQueue};
use gpufleet_core::types::InstanceListQuery;

use crate::jobs::JobContext;

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub job_timeout: Duration,
    /// Cap on `MIGRATE_INSTANCE` jobs in `PROCESSING` at once.
    pub max_concurrent: u64,
    /// Log intent without enqueueing migrations.
    pub dry_run: bool,
    /// When false, a failed migration is terminal on its first error.
    pub retry_failed: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15 * 60),
            job_timeout: Duration::from_secs(600),
            max_concurrent: 5,
            dry_run: false,
            retry_failed: true,
        }
    }
}

/// What one scan accomplished; logged per tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickMetrics {
    pub candidates_found: u64,
    pub enqueued: u64,
    pub skipped_duplicate: u64,
    pub skipped_concurrency: u64,
    pub duration_ms: u64,
    pub errors_by_type: HashMap<String, u64>,
}

const ERROR_WINDOW: Duration = Duration::from_secs(15 * 60);
const ERROR_RATE_ALERT: f64 = 0.5;

pub struct MigrationScheduler {
    queue: Arc<JobQueue>,
    cfg: MigrationConfig,
    window: Mutex<VecDeque<(Instant, bool)>>,
}

impl MigrationScheduler {
    pub fn new(queue: Arc<JobQueue>, cfg: MigrationConfig) -> Self {
        Self {
            queue,
            cfg,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Spawn the ticker. No-op handle when migrations are disabled.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.cfg.enabled {
                tracing::info!("migration scheduler disabled");
                return;
            }
            let mut ticker = tokio::time::interval(self.cfg.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let ok = self.tick().await;
                self.record_outcome(ok).await;
            }
        })
    }

    /// Enqueue one batch scan, deduplicated on the tick bucket.
    async fn tick(&self) -> bool {
        let bucket = Utc::now().timestamp() / self.cfg.interval.as_secs().max(1) as i64;
        let tick_bucket = bucket.to_string();
        let result = self
            .queue
            .enqueue(
                JobPayload::MigrateBatch {
                    tick_bucket: tick_bucket.clone(),
                },
                EnqueueOpts {
                    priority: JobPriority::Low,
                    idempotency_key: Some(format!("migrate-batch:{tick_bucket}")),
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(job) => {
                tracing::debug!(job_id = %job.id, tick_bucket, "migration batch scheduled");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to schedule migration batch");
                false
            }
        }
    }

    /// Track tick outcomes over a rolling window; alert past the threshold.
    async fn record_outcome(&self, ok: bool) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        window.push_back((now, ok));
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > ERROR_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        let failures = window.iter().filter(|(_, ok)| !ok).count();
        let rate = failures as f64 / window.len().max(1) as f64;
        if window.len() >= 2 && rate >= ERROR_RATE_ALERT {
            tracing::warn!(
                failures,
                window = window.len(),
                "migration scheduler error rate above alert threshold"
            );
        }
    }
}

/// Body of a `MIGRATE_BATCH` job: list reclaim-flagged instances and enqueue
/// one `MIGRATE_INSTANCE` per candidate, deduplicated and concurrency-capped.
pub async fn run_batch_scan(ctx: &JobContext) -> Result<TickMetrics> {
    let started = Instant::now();
    let mut metrics = TickMetrics::default();

    let candidates = ctx
        .provider
        .list_instances(&InstanceListQuery {
            reclaim_flagged_only: true,
            name: None,
        })
        .await?;
    metrics.candidates_found = candidates.len() as u64;

    for candidate in candidates {
        let dedup_key = format!("migrate:{}", candidate.id);
        match ctx.queue.find_by_idempotency_key(&dedup_key).await {
            Ok(Some(_)) => {
                metrics.skipped_duplicate += 1;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                *metrics.errors_by_type.entry(e.code().to_string()).or_default() += 1;
                continue;
            }
        }

        let in_flight = ctx.queue.processing_count(JobType::MigrateInstance).await?;
        if in_flight + metrics.enqueued >= ctx.migration.max_concurrent {
            metrics.skipped_concurrency += 1;
            continue;
        }

        if ctx.migration.dry_run {
            tracing::info!(
                upstream_id = %candidate.id,
                reason = candidate.reclaim_reason.as_deref().unwrap_or("reclaim flagged"),
                "dry run: would enqueue migration"
            );
            continue;
        }

        let enqueue = ctx
            .queue
            .enqueue(
                JobPayload::MigrateInstance {
                    upstream_id: candidate.id.clone(),
                    reason: candidate
                        .reclaim_reason
                        .clone()
                        .unwrap_or_else(|| "reclaim flagged".into()),
                },
                EnqueueOpts {
                    idempotency_key: Some(dedup_key),
                    max_attempts: Some(if ctx.migration.retry_failed { 3 } else { 1 }),
                    ..Default::default()
                },
            )
            .await;
        match enqueue {
            Ok(_) => metrics.enqueued += 1,
            Err(e) => {
                *metrics.errors_by_type.entry(e.code().to_string()).or_default() += 1;
            }
        }
    }

    metrics.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        candidates = metrics.candidates_found,
        enqueued = metrics.enqueued,
        skipped_duplicate = metrics.skipped_duplicate,
        skipped_concurrency = metrics.skipped_concurrency,
        duration_ms = metrics.duration_ms,
        "migration batch scan finished"
    );
    Ok(metrics)
}
