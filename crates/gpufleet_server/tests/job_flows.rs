//! End-to-end job flows over the in-memory backend: creation retries,
//! terminal upstream rejections, readiness, webhooks, and migration dedup.
//!
//! Tests drive handlers the way the dispatcher does (pop → execute →
//! ack/nack by error class) so outcomes are deterministic.

mod common;

use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gpufleet_core::job::{Job, JobPayload, JobStatus, JobType};
use gpufleet_core::proto::{CreateInstanceRequest, TemplateId};
use gpufleet_core::queue::{EnqueueOpts, JobQueue};
use gpufleet_core::types::{
    InstanceStatus, PortKind, ProviderInstance, ProviderInstanceStatus, ProviderPortBinding,
};
use gpufleet_server::dispatcher::JobHandler;
use gpufleet_server::jobs::{
    CreateInstanceHandler, HealthCheckHandler, MigrateInstanceHandler, MonitorHandler,
    SendWebhookHandler,
};
use gpufleet_server::migration::run_batch_scan;
use gpufleet_server::webhook::sign;

/// Pop one job of `job_type`, run it through `handler`, and settle it the
/// way the dispatcher would.
async fn step(queue: &JobQueue, job_type: JobType, handler: &dyn JobHandler) -> Job {
    queue.promote_due(Utc::now()).await.unwrap();
    let job = queue
        .pop(job_type, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("expected a {job_type} job"));
    match handler.execute(&job).await {
        Ok(()) => queue.ack(&job.id).await.unwrap(),
        Err(e) => queue
            .nack(&job.id, &e.to_string(), e.is_retryable())
            .await
            .unwrap(),
    }
}

fn create_request(name: &str, webhook_url: Option<String>) -> CreateInstanceRequest {
    CreateInstanceRequest {
        name: name.into(),
        product_name: "RTX-4090".into(),
        template_id: TemplateId::Text("tpl-42".into()),
        gpu_num: None,
        rootfs_size: None,
        region: None,
        webhook_url,
    }
}

// Transient 503s from the provider: the creation job retries under the
// queue's backoff and completes on the third claim.
#[tokio::test]
async fn create_retries_transient_upstream_failures() {
    let app = common::build();
    app.provider.script_create(vec![Err(503), Err(503), Ok(())]);

    let resp = app
        .state
        .orchestrator
        .create_instance(&create_request("gpu-1", None))
        .await
        .unwrap();
    let handler = CreateInstanceHandler::new(app.job_ctx.clone());

    let first = step(&app.queue, JobType::CreateInstance, &handler).await;
    assert_eq!(first.status, JobStatus::Pending);
    let second = step(&app.queue, JobType::CreateInstance, &handler).await;
    assert_eq!(second.status, JobStatus::Pending);
    let third = step(&app.queue, JobType::CreateInstance, &handler).await;
    assert_eq!(third.status, JobStatus::Completed);
    assert_eq!(third.attempts, 3);

    let state = app.store.get(&resp.instance_id).await.unwrap();
    assert_eq!(state.status, InstanceStatus::Starting);
    assert!(state.upstream_id.is_some());
}

// A 403 is terminal: one attempt, the job fails, the instance flips to
// FAILED, and a failure webhook is queued.
#[tokio::test]
async fn create_rejection_fails_instance_and_queues_failure_webhook() {
    let app = common::build();
    app.provider.script_create(vec![Err(403)]);

    let resp = app
        .state
        .orchestrator
        .create_instance(&create_request(
            "gpu-1",
            Some("https://hooks.example.com/x".into()),
        ))
        .await
        .unwrap();
    let handler = CreateInstanceHandler::new(app.job_ctx.clone());

    let job = step(&app.queue, JobType::CreateInstance, &handler).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);

    let state = app.store.get(&resp.instance_id).await.unwrap();
    assert_eq!(state.status, InstanceStatus::Failed);
    assert!(state.failed_at.is_some());
    assert!(state.last_error.as_deref().unwrap().contains("403"));

    let webhook_job = app
        .queue
        .pop(JobType::SendWebhook, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("failure webhook queued");
    let JobPayload::SendWebhook { payload, .. } = &webhook_job.payload else {
        panic!("wrong payload kind");
    };
    assert_eq!(payload["event"], "instance.failed");
}

// Full happy path: create → monitor → health check → ready webhook, with a
// verifiable HMAC signature on the delivered body.
#[tokio::test]
async fn create_flow_reaches_ready_and_delivers_signed_webhook() {
    let app = common::build();
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;
    let probe_target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&probe_target)
        .await;

    let resp = app
        .state
        .orchestrator
        .create_instance(&create_request(
            "gpu-1",
            Some(format!("{}/hook", receiver.uri())),
        ))
        .await
        .unwrap();

    let create = CreateInstanceHandler::new(app.job_ctx.clone());
    let created = step(&app.queue, JobType::CreateInstance, &create).await;
    assert_eq!(created.status, JobStatus::Completed);

    // Point the provider's port binding at the local probe target and mark
    // the instance running so the monitor hands off to the health check.
    let upstream_id = app
        .store
        .get(&resp.instance_id)
        .await
        .unwrap()
        .upstream_id
        .unwrap();
    {
        let address = *probe_target.address();
        let mut instances = app.provider.instances.lock().unwrap();
        let instance = instances.get_mut(&upstream_id).unwrap();
        instance.status = ProviderInstanceStatus::Running;
        instance.ports = vec![ProviderPortBinding {
            port: 8888,
            kind: PortKind::Http,
            host: Some(address.ip().to_string()),
            external_port: Some(address.port()),
        }];
    }

    let monitor = MonitorHandler::new(app.job_ctx.clone());
    let monitored = step(&app.queue, JobType::MonitorStartup, &monitor).await;
    assert_eq!(monitored.status, JobStatus::Completed);
    assert_eq!(
        app.store.get(&resp.instance_id).await.unwrap().status,
        InstanceStatus::HealthChecking
    );

    let health = HealthCheckHandler::new(app.job_ctx.clone());
    let checked = step(&app.queue, JobType::HealthCheck, &health).await;
    assert_eq!(checked.status, JobStatus::Completed);

    let state = app.store.get(&resp.instance_id).await.unwrap();
    assert_eq!(state.status, InstanceStatus::Ready);
    assert!(state.ready_at.is_some());

    let webhook = SendWebhookHandler::new(app.job_ctx.clone());
    let delivered = step(&app.queue, JobType::SendWebhook, &webhook).await;
    assert_eq!(delivered.status, JobStatus::Completed);

    // The receiver can reproduce the signature over the raw body.
    let requests = receiver.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let received = &requests[0];
    let signature = received
        .headers
        .get("x-signature")
        .expect("signature header")
        .to_str()
        .unwrap();
    assert_eq!(signature, sign("test-webhook-secret", &received.body));
    let event: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
    assert_eq!(event["event"], "instance.ready");
    assert_eq!(event["instanceId"], resp.instance_id.as_str());
}

// Readiness conjunction: a dead endpoint keeps the instance out of READY
// and the failure is recorded in the health check progress.
#[tokio::test]
async fn unreachable_probe_endpoint_fails_the_instance() {
    let app = common::build();
    let resp = app
        .state
        .orchestrator
        .create_instance(&create_request(
            "gpu-1",
            Some("https://hooks.example.com/x".into()),
        ))
        .await
        .unwrap();

    let create = CreateInstanceHandler::new(app.job_ctx.clone());
    step(&app.queue, JobType::CreateInstance, &create).await;

    let upstream_id = app
        .store
        .get(&resp.instance_id)
        .await
        .unwrap()
        .upstream_id
        .unwrap();
    {
        // Point the probe at a port nothing listens on.
        let mut instances = app.provider.instances.lock().unwrap();
        let instance = instances.get_mut(&upstream_id).unwrap();
        instance.status = ProviderInstanceStatus::Running;
        instance.ports = vec![ProviderPortBinding {
            port: 8888,
            kind: PortKind::Http,
            host: Some("127.0.0.1".into()),
            external_port: Some(9),
        }];
    }

    let monitor = MonitorHandler::new(app.job_ctx.clone());
    step(&app.queue, JobType::MonitorStartup, &monitor).await;
    let health = HealthCheckHandler::new(app.job_ctx.clone());
    let checked = step(&app.queue, JobType::HealthCheck, &health).await;
    assert_eq!(checked.status, JobStatus::Completed);

    let state = app.store.get(&resp.instance_id).await.unwrap();
    assert_eq!(state.status, InstanceStatus::Failed);
    let progress = state.health_check.expect("progress recorded");
    assert!(progress
        .endpoints
        .iter()
        .any(|e| e.last_error.is_some()));

    let webhook_job = app
        .queue
        .pop(JobType::SendWebhook, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("failure webhook queued");
    let JobPayload::SendWebhook { payload, .. } = &webhook_job.payload else {
        panic!("wrong payload kind");
    };
    assert_eq!(payload["event"], "instance.failed");
}

// Scheduler dedup: two ticks inside one bucket collapse to a single batch
// job; two scans never enqueue the same candidate twice.
#[tokio::test]
async fn migration_scan_is_deduplicated() {
    let app = common::build();

    let first = app
        .queue
        .enqueue(
            JobPayload::MigrateBatch {
                tick_bucket: "bucket-7".into(),
            },
            EnqueueOpts {
                idempotency_key: Some("migrate-batch:bucket-7".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let second = app
        .queue
        .enqueue(
            JobPayload::MigrateBatch {
                tick_bucket: "bucket-7".into(),
            },
            EnqueueOpts {
                idempotency_key: Some("migrate-batch:bucket-7".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    app.provider.put_instance(ProviderInstance {
        id: "up-doomed".into(),
        name: "gpu-doomed".into(),
        status: ProviderInstanceStatus::Running,
        ports: vec![],
        connection: None,
        reclaim_flagged: true,
        reclaim_reason: Some("spot reclaim".into()),
    });

    let scan = run_batch_scan(&app.job_ctx).await.unwrap();
    assert_eq!(scan.candidates_found, 1);
    assert_eq!(scan.enqueued, 1);

    let rescan = run_batch_scan(&app.job_ctx).await.unwrap();
    assert_eq!(rescan.enqueued, 0);
    assert_eq!(rescan.skipped_duplicate, 1);
}

// Migration execution: the local record follows the replacement instance
// and a migrated webhook is queued.
#[tokio::test]
async fn migrate_instance_repoints_the_local_record() {
    let app = common::build();
    let resp = app
        .state
        .orchestrator
        .create_instance(&create_request(
            "gpu-1",
            Some("https://hooks.example.com/x".into()),
        ))
        .await
        .unwrap();
    let create = CreateInstanceHandler::new(app.job_ctx.clone());
    step(&app.queue, JobType::CreateInstance, &create).await;
    let upstream_id = app
        .store
        .get(&resp.instance_id)
        .await
        .unwrap()
        .upstream_id
        .unwrap();

    app.queue
        .enqueue(
            JobPayload::MigrateInstance {
                upstream_id: upstream_id.clone(),
                reason: "spot reclaim".into(),
            },
            EnqueueOpts::default(),
        )
        .await
        .unwrap();
    let migrate = MigrateInstanceHandler::new(app.job_ctx.clone());
    let migrated = step(&app.queue, JobType::MigrateInstance, &migrate).await;
    assert_eq!(migrated.status, JobStatus::Completed);

    let state = app.store.get(&resp.instance_id).await.unwrap();
    assert_eq!(state.status, InstanceStatus::Starting);
    assert_eq!(state.upstream_id.as_deref(), Some(format!("{upstream_id}-m").as_str()));

    // Replacement startup is monitored; a migrated event is queued after it.
    assert!(app
        .queue
        .pop(JobType::MonitorStartup, Duration::from_secs(30))
        .await
        .unwrap()
        .is_some());
    let webhook_job = app
        .queue
        .pop(JobType::SendWebhook, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("migrated webhook queued");
    let JobPayload::SendWebhook { payload, .. } = &webhook_job.payload else {
        panic!("wrong payload kind");
    };
    assert_eq!(payload["event"], "instance.migrated");
}
