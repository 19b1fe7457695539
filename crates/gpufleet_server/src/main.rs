//! gpufleet_server — composition root.
//!
//! Reads config from env vars (see `config.rs` for the full table; a local
//! `.env` is honored), wires the Redis backend, provider adapter, caches,
//! queue, orchestrator, worker dispatcher, and migration scheduler, then
//! serves the REST surface until SIGINT.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use gpufleet_core::cache::CacheRegistry;
use gpufleet_core::job::{BackoffConfig, JobType};
use gpufleet_core::metrics::MetricsRegistry;
use gpufleet_core::ports::{KvBackend, ProviderApi};
use gpufleet_core::queue::{JobQueue, QueueConfig};
use gpufleet_core::selector::ProductSelector;
use gpufleet_core::service::{Orchestrator, OrchestratorConfig};
use gpufleet_core::state::{InstanceStateStore, StateCaches};
use gpufleet_core::template::TemplateResolver;
use gpufleet_provider::{NovitaClient, ProviderConfig};
use gpufleet_redis::RedisBackend;
use gpufleet_server::config::{Config, WorkerConcurrency};
use gpufleet_server::dispatcher::{DispatcherConfig, JobDispatcher};
use gpufleet_server::jobs::{
    CreateInstanceHandler, HealthCheckHandler, JobContext, MigrateBatchHandler,
    MigrateInstanceHandler, MonitorHandler, SendWebhookHandler,
};
use gpufleet_server::migration::MigrationScheduler;
use gpufleet_server::probe::ReadinessProber;
use gpufleet_server::router::{build_router, AppState};
use gpufleet_server::webhook::{WebhookConfig, WebhookDeliverer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{level},gpufleet_server={level}", level = config.log_level).into()
            }),
        )
        .init();

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // KV backend is the only cross-process coordination point.
    let redis_url = config.redis_connection_url()?;
    let kv: Arc<dyn KvBackend> = Arc::new(RedisBackend::connect(&redis_url).await?);
    tracing::info!("connected to redis");

    let caches = Arc::new(CacheRegistry::new());
    let products_cache = caches.create("products", 256, config.cache_ttl);
    let optimal_cache = caches.create("optimal-products", 256, config.cache_ttl);
    let templates_cache = caches.create("templates", 128, Duration::from_secs(600));
    let state_caches = StateCaches {
        details: caches.create("instance-details", 1024, Duration::from_secs(30)),
        states: caches.create("instance-states", 1024, Duration::from_secs(60)),
        merged: caches.create("merged-instances", 32, config.merged_cache_ttl),
    };

    let queue = Arc::new(JobQueue::new(
        Arc::clone(&kv),
        QueueConfig {
            namespace: config.redis_namespace.clone(),
            backoff: BackoffConfig::default(),
            ..Default::default()
        },
    ));
    let store = Arc::new(InstanceStateStore::new(
        Arc::clone(&kv),
        config.redis_namespace.clone(),
        state_caches.clone(),
    ));

    let provider: Arc<dyn ProviderApi> = Arc::new(NovitaClient::new(ProviderConfig {
        base_url: config.upstream_base_url.clone(),
        api_key: config.upstream_api_key.clone(),
        request_timeout: config.request_timeout,
        max_retry_attempts: config.max_retry_attempts,
        ..Default::default()
    })?);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&provider),
        Arc::clone(&queue),
        Arc::clone(&store),
        ProductSelector::new(
            Arc::clone(&provider),
            products_cache,
            optimal_cache,
        ),
        TemplateResolver::new(Arc::clone(&provider), templates_cache),
        state_caches,
        OrchestratorConfig {
            regions: config.regions.clone(),
            estimated_ready: Duration::from_secs(300),
            monitor_max_wait: config.monitor_max_wait,
            enable_fallback_to_local: true,
        },
    ));

    let metrics = Arc::new(MetricsRegistry::new());
    let webhooks = Arc::new(WebhookDeliverer::new(WebhookConfig {
        timeout: config.webhook_timeout,
        secret: config.webhook_secret.clone(),
        ..Default::default()
    })?);

    let job_ctx = Arc::new(JobContext {
        provider: Arc::clone(&provider),
        queue: Arc::clone(&queue),
        store: Arc::clone(&store),
        webhooks,
        prober: Arc::new(ReadinessProber::new()),
        probe_config: config.probe.clone(),
        poll_interval: config.instance_poll_interval,
        monitor_max_wait: config.monitor_max_wait,
        migration: config.migration.clone(),
    });

    // Worker pool: one handler per job type, per-type concurrency caps.
    let concurrency = WorkerConcurrency::default();
    let job_timeout = Duration::from_secs(600);
    let mut dispatcher = JobDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&metrics),
        DispatcherConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            ..Default::default()
        },
    );
    dispatcher
        .register(
            JobType::CreateInstance,
            Arc::new(CreateInstanceHandler::new(Arc::clone(&job_ctx))),
            concurrency.create_instance,
            job_timeout,
        )
        .register(
            JobType::MonitorStartup,
            Arc::new(MonitorHandler::new(Arc::clone(&job_ctx))),
            concurrency.monitor,
            job_timeout,
        )
        .register(
            JobType::MonitorInstance,
            Arc::new(MonitorHandler::new(Arc::clone(&job_ctx))),
            concurrency.monitor,
            job_timeout,
        )
        .register(
            JobType::HealthCheck,
            Arc::new(HealthCheckHandler::new(Arc::clone(&job_ctx))),
            concurrency.health_check,
            job_timeout,
        )
        .register(
            JobType::SendWebhook,
            Arc::new(SendWebhookHandler::new(Arc::clone(&job_ctx))),
            concurrency.send_webhook,
            Duration::from_secs(60),
        )
        .register(
            JobType::MigrateBatch,
            Arc::new(MigrateBatchHandler::new(Arc::clone(&job_ctx))),
            concurrency.migrate_batch,
            config.migration.job_timeout,
        )
        .register(
            JobType::MigrateInstance,
            Arc::new(MigrateInstanceHandler::new(Arc::clone(&job_ctx))),
            concurrency.migrate_instance,
            config.migration.job_timeout,
        );
    let dispatcher_handle = dispatcher.start();
    tracing::info!("job dispatcher started");

    // Background periodics: migration ticks, cache sweep, system gauges.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(MigrationScheduler::new(
        Arc::clone(&queue),
        config.migration.clone(),
    ));
    let scheduler_task = scheduler.start(shutdown_rx.clone());
    let sweeper_task = spawn_cache_sweeper(Arc::clone(&caches), shutdown_rx.clone());
    let sampler_task = spawn_system_sampler(Arc::clone(&metrics), shutdown_rx);

    let state = Arc::new(AppState {
        orchestrator,
        metrics,
        caches,
        queue,
        store,
        provider,
    });
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("gpufleet_server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Drain: stop periodics, then give in-flight jobs a bounded window.
    let _ = shutdown_tx.send(true);
    for task in [scheduler_task, sweeper_task, sampler_task] {
        task.abort();
    }
    let undrained = dispatcher_handle.shutdown(Duration::from_secs(30)).await;
    if undrained > 0 {
        tracing::warn!(undrained, "jobs left processing; leases will be reclaimed on restart");
    }
    Ok(())
}

fn spawn_cache_sweeper(
    caches: Arc<CacheRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let removed = caches.cleanup_all();
            if removed > 0 {
                tracing::debug!(removed, "swept expired cache entries");
            }
        }
    })
}

fn spawn_system_sampler(
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = sysinfo::System::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            system.refresh_memory();
            system.refresh_cpu_usage();
            metrics.set_system(system.used_memory(), system.global_cpu_usage());
        }
    })
}
