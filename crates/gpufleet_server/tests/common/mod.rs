//! Shared fixture: a full application wired over the in-memory KV backend
//! and the scripted provider stub.

// Each integration test binary compiles its own copy; not every binary
// touches every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gpufleet_core::cache::CacheRegistry;
use gpufleet_core::metrics::MetricsRegistry;
use gpufleet_core::ports::ProviderApi;
use gpufleet_core::job::BackoffConfig;
use gpufleet_core::kv::MemoryBackend;
use gpufleet_core::queue::{JobQueue, QueueConfig};
use gpufleet_core::selector::ProductSelector;
use gpufleet_core::service::{Orchestrator, OrchestratorConfig};
use gpufleet_core::state::{InstanceStateStore, StateCaches};
use gpufleet_core::stub::StubProvider;
use gpufleet_core::template::TemplateResolver;
use gpufleet_core::types::{EnvVar, PortKind, PortMapping, Product, RegionConfig, Template};
use gpufleet_server::jobs::JobContext;
use gpufleet_server::migration::MigrationConfig;
use gpufleet_server::probe::ReadinessProber;
use gpufleet_server::router::AppState;
use gpufleet_server::webhook::{WebhookConfig, WebhookDeliverer};

pub struct TestApp {
    pub state: Arc<AppState>,
    pub provider: Arc<StubProvider>,
    pub queue: Arc<JobQueue>,
    pub store: Arc<InstanceStateStore>,
    pub job_ctx: Arc<JobContext>,
}

pub fn two_regions() -> Vec<RegionConfig> {
    vec![
        RegionConfig {
            id: "r1".into(),
            name: "eu-01".into(),
            priority: 1,
        },
        RegionConfig {
            id: "r2".into(),
            name: "us-01".into(),
            priority: 2,
        },
    ]
}

pub fn product(id: &str, region: &str, price: f64) -> Product {
    Product {
        id: id.into(),
        name: "RTX-4090".into(),
        region: region.into(),
        spot_price_usd_per_hour: price,
        availability: true,
    }
}

pub fn template() -> Template {
    Template {
        id: "tpl-42".into(),
        image_url: "https://registry.example.com/gpu/base:latest".into(),
        image_auth_id: None,
        ports: vec![PortMapping {
            port: 8888,
            kind: PortKind::Http,
        }],
        envs: vec![EnvVar {
            key: "MODEL".into(),
            value: "llama".into(),
        }],
    }
}

/// Build the whole app. R1 has no products; R2 carries an expensive and a
/// cheap offer, so the selector must fall through and pick the cheap one.
pub fn build() -> TestApp {
    let provider = Arc::new(StubProvider::new());
    provider.add_products("r2", vec![product("pricey", "us-01", 2.0), product("cheap", "us-01", 1.5)]);
    provider.add_template(template());

    let kv = Arc::new(MemoryBackend::new());
    let queue = Arc::new(JobQueue::new(
        Arc::clone(&kv) as _,
        QueueConfig {
            namespace: "test".into(),
            backoff: BackoffConfig {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                max_jitter: Duration::ZERO,
            },
            ..Default::default()
        },
    ));

    let caches = Arc::new(CacheRegistry::new());
    let state_caches = StateCaches {
        details: caches.create("instance-details", 64, Duration::from_secs(30)),
        states: caches.create("instance-states", 64, Duration::from_secs(60)),
        merged: caches.create("merged-instances", 16, Duration::from_secs(60)),
    };
    let store = Arc::new(InstanceStateStore::new(
        Arc::clone(&kv) as _,
        "test",
        state_caches.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&provider) as Arc<dyn ProviderApi>,
        Arc::clone(&queue),
        Arc::clone(&store),
        ProductSelector::new(
            Arc::clone(&provider) as _,
            caches.create("products", 64, Duration::from_secs(300)),
            caches.create("optimal-products", 64, Duration::from_secs(300)),
        ),
        TemplateResolver::new(
            Arc::clone(&provider) as _,
            caches.create("templates", 64, Duration::from_secs(600)),
        ),
        state_caches,
        OrchestratorConfig {
            regions: two_regions(),
            ..Default::default()
        },
    ));

    let metrics = Arc::new(MetricsRegistry::new());
    let webhooks = Arc::new(
        WebhookDeliverer::new(WebhookConfig {
            timeout: Duration::from_secs(2),
            secret: Some("test-webhook-secret".into()),
            retry_base: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap(),
    );
    let job_ctx = Arc::new(JobContext {
        provider: Arc::clone(&provider) as _,
        queue: Arc::clone(&queue),
        store: Arc::clone(&store),
        webhooks,
        prober: Arc::new(ReadinessProber::new()),
        probe_config: gpufleet_core::types::ProbeConfig {
            timeout_ms: 500,
            retry_attempts: 2,
            retry_delay_ms: 5,
            max_wait_ms: 2_000,
            error_indicator: None,
        },
        poll_interval: Duration::from_millis(10),
        monitor_max_wait: Duration::from_secs(60),
        migration: MigrationConfig {
            interval: Duration::from_millis(100),
            max_concurrent: 2,
            ..Default::default()
        },
    });

    let state = Arc::new(AppState {
        orchestrator,
        metrics,
        caches,
        queue: Arc::clone(&queue),
        store: Arc::clone(&store),
        provider: Arc::clone(&provider) as _,
    });

    TestApp {
        state,
        provider,
        queue,
        store,
        job_ctx,
    }
}
