//! Job dispatcher — typed handlers, bounded concurrency, graceful drain.
//!
//! One coordinator task per registered job type pops work while its
//! concurrency budget allows; a single maintenance task promotes due retries,
//! reclaims expired leases, refreshes queue-depth gauges, and sweeps retained
//! job bodies. Spawn via [`JobDispatcher::start`]; stop via
//! [`DispatcherHandle::shutdown`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{Job, JobType};
use gpufleet_core::metrics::MetricsRegistry;
use gpufleet_core::queue::JobQueue;

/// A typed job handler. Errors are classified through
/// `FleetError::is_retryable` and turned into nacks.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), FleetError>;
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    job_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cadence of promote/reclaim/depth maintenance.
    pub maintenance_interval: Duration,
    /// Sleep when a type's queue is empty or its budget is saturated.
    pub idle_backoff: Duration,
    /// Global cap across all types.
    pub max_concurrent_jobs: usize,
    /// Extra lease time past the handler deadline so a live handler is never
    /// repossessed mid-run.
    pub lease_margin: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_millis(500),
            idle_backoff: Duration::from_millis(150),
            max_concurrent_jobs: 10,
            lease_margin: Duration::from_secs(30),
        }
    }
}

pub struct JobDispatcher {
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsRegistry>,
    registrations: HashMap<JobType, Registration>,
    cfg: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(queue: Arc<JobQueue>, metrics: Arc<MetricsRegistry>, cfg: DispatcherConfig) -> Self {
        Self {
            queue,
            metrics,
            registrations: HashMap::new(),
            cfg,
        }
    }

    pub fn register(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        job_timeout: Duration,
    ) -> &mut Self {
        self.registrations.insert(
            job_type,
            Registration {
                handler,
                concurrency: concurrency.max(1),
                job_timeout,
            },
        );
        self
    }

    /// Spawn the maintenance loop and one coordinator per registered type.
    pub fn start(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let global_budget = Arc::new(Semaphore::new(self.cfg.max_concurrent_jobs));
        let mut tasks = Vec::new();

        tasks.push(spawn_maintenance(
            Arc::clone(&self.queue),
            Arc::clone(&self.metrics),
            self.registrations.keys().copied().collect(),
            self.cfg.maintenance_interval,
            shutdown_rx.clone(),
        ));

        for (job_type, registration) in self.registrations {
            tasks.push(spawn_coordinator(
                job_type,
                registration,
                Arc::clone(&self.queue),
                Arc::clone(&self.metrics),
                Arc::clone(&global_budget),
                Arc::clone(&in_flight),
                self.cfg.clone(),
                shutdown_rx.clone(),
            ));
        }

        DispatcherHandle {
            shutdown_tx,
            tasks,
            in_flight,
        }
    }
}

pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl DispatcherHandle {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop popping, wait up to `timeout` for in-flight handlers, and return
    /// how many were still running. Undrained jobs stay in `Processing`;
    /// their leases expire and are reclaimed after restart.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for task in &self.tasks {
            task.abort();
        }
        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown timeout; leaving jobs to lease reclamation");
        }
        remaining
    }
}

fn spawn_maintenance(
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsRegistry>,
    types: Vec<JobType>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Sweep retention roughly once a minute regardless of tick rate.
        let sweep_every = (60_000 / interval.as_millis().max(1)) as u64;
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            tick += 1;
            let now = Utc::now();
            if let Err(e) = queue.promote_due(now).await {
                tracing::warn!(error = %e, "promote_due failed");
            }
            match queue.reclaim_expired_leases(now).await {
                Ok(reclaimed) if reclaimed > 0 => {
                    tracing::info!(reclaimed, "reclaimed expired job leases");
                }
                Err(e) => tracing::warn!(error = %e, "lease reclamation failed"),
                _ => {}
            }
            if let Ok(stats) = queue.stats().await {
                for job_type in &types {
                    let depth = stats
                        .ready_by_type
                        .get(job_type.as_str())
                        .copied()
                        .unwrap_or(0);
                    metrics.set_queue_depth(*job_type, depth);
                }
            }
            if tick % sweep_every.max(1) == 0 {
                if let Err(e) = queue.cleanup_retention(now).await {
                    tracing::warn!(error = %e, "retention sweep failed");
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_coordinator(
    job_type: JobType,
    registration: Registration,
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsRegistry>,
    global_budget: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    cfg: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let type_budget = Arc::new(Semaphore::new(registration.concurrency));
        let lease = registration.job_timeout + cfg.lease_margin;
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Claim budget before popping so a popped job always has a slot.
            let Ok(type_permit) = Arc::clone(&type_budget).try_acquire_owned() else {
                idle(&mut shutdown, cfg.idle_backoff).await;
                continue;
            };
            let Ok(global_permit) = Arc::clone(&global_budget).try_acquire_owned() else {
                drop(type_permit);
                idle(&mut shutdown, cfg.idle_backoff).await;
                continue;
            };

            match queue.pop(job_type, lease).await {
                Ok(Some(job)) => {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let queue = Arc::clone(&queue);
                    let metrics = Arc::clone(&metrics);
                    let handler = Arc::clone(&registration.handler);
                    let in_flight = Arc::clone(&in_flight);
                    let job_timeout = registration.job_timeout;
                    tokio::spawn(async move {
                        run_job(job, handler, queue, metrics, job_timeout).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        drop(type_permit);
                        drop(global_permit);
                    });
                }
                Ok(None) => {
                    drop(type_permit);
                    drop(global_permit);
                    idle(&mut shutdown, cfg.idle_backoff).await;
                }
                Err(e) => {
                    drop(type_permit);
                    drop(global_permit);
                    tracing::warn!(job_type = %job_type, error = %e, "pop failed");
                    idle(&mut shutdown, cfg.idle_backoff).await;
                }
            }
        }
    })
}

async fn idle(shutdown: &mut watch::Receiver<bool>, backoff: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = shutdown.changed() => {}
    }
}

async fn run_job(
    job: Job,
    handler: Arc<dyn JobHandler>,
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsRegistry>,
    job_timeout: Duration,
) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(job_timeout, handler.execute(&job)).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(())) => {
            metrics.record_job(job.job_type, true, elapsed);
            if let Err(e) = queue.ack(&job.id).await {
                tracing::error!(job_id = %job.id, error = %e, "ack failed");
            }
        }
        Ok(Err(handler_error)) => {
            metrics.record_job(job.job_type, false, elapsed);
            let retryable = handler_error.is_retryable();
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retryable,
                error = %handler_error,
                "job handler failed"
            );
            if let Err(e) = queue
                .nack(&job.id, &handler_error.to_string(), retryable)
                .await
            {
                tracing::error!(job_id = %job.id, error = %e, "nack failed");
            }
        }
        Err(_) => {
            // Deadline exceeded counts as a retryable attempt.
            metrics.record_job(job.job_type, false, elapsed);
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, "job deadline exceeded");
            if let Err(e) = queue.nack(&job.id, "job deadline exceeded", true).await {
                tracing::error!(job_id = %job.id, error = %e, "nack failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use gpufleet_core::job::{JobPayload, JobStatus};
    use gpufleet_core::kv::MemoryBackend;
    use gpufleet_core::queue::{EnqueueOpts, QueueConfig};

    struct CountingHandler {
        executed: AtomicU32,
        delay: Duration,
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn execute(&self, _job: &Job) -> Result<(), FleetError> {
            tokio::time::sleep(self.delay).await;
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(FleetError::Network("transient".into()));
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            maintenance_interval: Duration::from_millis(20),
            idle_backoff: Duration::from_millis(10),
            max_concurrent_jobs: 8,
            lease_margin: Duration::from_secs(5),
        }
    }

    fn queue_with_zero_backoff() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            Arc::new(MemoryBackend::new()),
            QueueConfig {
                namespace: "dispatch-test".into(),
                backoff: gpufleet_core::job::BackoffConfig {
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                    max_jitter: Duration::ZERO,
                },
                ..Default::default()
            },
        ))
    }

    fn payload(n: u32) -> JobPayload {
        JobPayload::MigrateInstance {
            upstream_id: format!("up-{n}"),
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn executes_queued_jobs_and_acks() {
        let queue = queue_with_zero_backoff();
        for n in 0..3 {
            queue.enqueue(payload(n), EnqueueOpts::default()).await.unwrap();
        }

        let handler = Arc::new(CountingHandler {
            executed: AtomicU32::new(0),
            delay: Duration::from_millis(1),
            fail_first: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let mut dispatcher =
            JobDispatcher::new(Arc::clone(&queue), metrics.clone(), fast_dispatcher_config());
        dispatcher.register(
            JobType::MigrateInstance,
            handler.clone(),
            2,
            Duration::from_secs(5),
        );
        let handle = dispatcher.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.shutdown(Duration::from_secs(2)).await, 0);

        assert_eq!(handler.executed.load(Ordering::SeqCst), 3);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 3);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let queue = queue_with_zero_backoff();
        queue.enqueue(payload(1), EnqueueOpts::default()).await.unwrap();

        let handler = Arc::new(CountingHandler {
            executed: AtomicU32::new(0),
            delay: Duration::from_millis(1),
            fail_first: AtomicU32::new(2),
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let mut dispatcher =
            JobDispatcher::new(Arc::clone(&queue), metrics, fast_dispatcher_config());
        dispatcher.register(
            JobType::MigrateInstance,
            handler.clone(),
            1,
            Duration::from_secs(5),
        );
        let handle = dispatcher.start();

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.shutdown(Duration::from_secs(2)).await;

        assert_eq!(handler.executed.load(Ordering::SeqCst), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_intake_and_reports_undrained_work() {
        let queue = queue_with_zero_backoff();
        queue.enqueue(payload(1), EnqueueOpts::default()).await.unwrap();

        let handler = Arc::new(CountingHandler {
            executed: AtomicU32::new(0),
            delay: Duration::from_secs(30),
            fail_first: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let mut dispatcher =
            JobDispatcher::new(Arc::clone(&queue), metrics, fast_dispatcher_config());
        dispatcher.register(
            JobType::MigrateInstance,
            handler,
            1,
            Duration::from_secs(60),
        );
        let handle = dispatcher.start();

        // Let the slow job get picked up, then drain with a short budget.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let undrained = handle.shutdown(Duration::from_millis(100)).await;
        assert_eq!(undrained, 1);

        // The job is still leased in PROCESSING; nothing acked it.
        let job = queue
            .stats()
            .await
            .unwrap();
        assert_eq!(job.completed, 0);
        assert_eq!(
            job.processing_by_type.get("MIGRATE_INSTANCE").copied(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn deadline_exceeded_counts_as_retryable_attempt() {
        let queue = queue_with_zero_backoff();
        let job = queue
            .enqueue(
                payload(1),
                EnqueueOpts {
                    max_attempts: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            executed: AtomicU32::new(0),
            delay: Duration::from_secs(30),
            fail_first: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let mut dispatcher =
            JobDispatcher::new(Arc::clone(&queue), metrics, fast_dispatcher_config());
        // 30 ms deadline against a 30 s handler: every attempt times out.
        dispatcher.register(
            JobType::MigrateInstance,
            handler,
            1,
            Duration::from_millis(30),
        );
        let handle = dispatcher.start();

        tokio::time::sleep(Duration::from_millis(800)).await;
        handle.shutdown(Duration::from_millis(100)).await;

        let final_job = queue.load(&job.id).await.unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
        assert_eq!(final_job.attempts, 2);
        assert_eq!(final_job.error.as_deref(), Some("job deadline exceeded"));
    }
}
