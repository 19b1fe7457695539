//! Readiness prober — parallel multi-endpoint HTTP probing.
//!
//! An instance is ready only when every configured endpoint has answered
//! healthily at least once inside the overall wait envelope. Endpoint probes
//! run concurrently; per-endpoint retries back off exponentially with jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use gpufleet_core::job::{retry_delay, BackoffConfig};
use gpufleet_core::types::{
    EndpointProbeState, HealthCheckProgress, ProbeConfig, ProbeEndpoint, ProbeStatus,
};

/// Why one probe attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    ConnectionRefused,
    Tls,
    Dns,
    HttpStatus(u16),
    BodyRejected,
}

impl ProbeFailure {
    /// Terminal failures stop probing an endpoint immediately: a TLS
    /// misconfiguration or a settled 4xx will not heal by waiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionRefused | Self::Dns | Self::BodyRejected => true,
            Self::HttpStatus(status) => *status >= 500,
            Self::Tls => false,
        }
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Tls => write!(f, "tls handshake failed"),
            Self::Dns => write!(f, "dns resolution failed"),
            Self::HttpStatus(status) => write!(f, "unexpected http status {status}"),
            Self::BodyRejected => write!(f, "body contained error indicator"),
        }
    }
}

/// Observer for incremental progress; the health-check job writes snapshots
/// into `InstanceState.health_check` through this.
#[async_trait]
pub trait ProbeProgress: Send + Sync {
    async fn update(&self, progress: HealthCheckProgress);
}

pub struct NoopProgress;

#[async_trait]
impl ProbeProgress for NoopProgress {
    async fn update(&self, _progress: HealthCheckProgress) {}
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub ready: bool,
    pub endpoints: Vec<EndpointProbeState>,
}

impl ProbeReport {
    /// First failing endpoint's error, for `InstanceState.last_error`.
    pub fn first_failure(&self) -> Option<String> {
        self.endpoints
            .iter()
            .find(|e| e.status != ProbeStatus::Succeeded)
            .map(|e| {
                format!(
                    "{}: {}",
                    e.endpoint,
                    e.last_error.as_deref().unwrap_or("not probed in time")
                )
            })
    }
}

#[derive(Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProber {
    pub fn new() -> Self {
        Self {
            // Per-request deadlines come from the probe config.
            client: reqwest::Client::new(),
        }
    }

    /// Probe every endpoint in parallel inside the `max_wait_ms` envelope.
    pub async fn probe_all(
        &self,
        endpoints: &[ProbeEndpoint],
        config: &ProbeConfig,
        progress: Arc<dyn ProbeProgress>,
    ) -> ProbeReport {
        let shared: Arc<Mutex<Vec<EndpointProbeState>>> = Arc::new(Mutex::new(
            endpoints
                .iter()
                .map(|e| EndpointProbeState {
                    endpoint: e.to_string(),
                    attempts: 0,
                    last_error: None,
                    last_checked_at: None,
                    status: ProbeStatus::Pending,
                })
                .collect(),
        ));

        let mut tasks = JoinSet::new();
        for (index, endpoint) in endpoints.iter().cloned().enumerate() {
            let client = self.client.clone();
            let config = config.clone();
            let shared = Arc::clone(&shared);
            let progress = Arc::clone(&progress);
            tasks.spawn(async move {
                probe_endpoint(client, endpoint, config, index, shared, progress).await
            });
        }

        let envelope = Duration::from_millis(config.max_wait_ms);
        let all_done = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(envelope, all_done).await.is_err() {
            tasks.abort_all();
        }

        let mut endpoints = shared.lock().await.clone();
        // Anything still pending ran out of the envelope.
        for state in &mut endpoints {
            if state.status == ProbeStatus::Pending {
                state.status = ProbeStatus::Failed;
                state
                    .last_error
                    .get_or_insert_with(|| "did not respond within the wait envelope".into());
            }
        }
        let ready = endpoints
            .iter()
            .all(|e| e.status == ProbeStatus::Succeeded);
        let report = ProbeReport { ready, endpoints };

        progress
            .update(HealthCheckProgress {
                status: if ready {
                    ProbeStatus::Succeeded
                } else {
                    ProbeStatus::Failed
                },
                endpoints: report.endpoints.clone(),
            })
            .await;
        report
    }
}

async fn probe_endpoint(
    client: reqwest::Client,
    endpoint: ProbeEndpoint,
    config: ProbeConfig,
    index: usize,
    shared: Arc<Mutex<Vec<EndpointProbeState>>>,
    progress: Arc<dyn ProbeProgress>,
) {
    let backoff = BackoffConfig {
        base_delay: Duration::from_millis(config.retry_delay_ms),
        max_delay: Duration::from_millis(config.retry_delay_ms.saturating_mul(16)),
        max_jitter: Duration::from_millis(config.retry_delay_ms / 4),
    };

    for attempt in 1..=config.retry_attempts.max(1) {
        let outcome = probe_once(&client, &endpoint, &config).await;
        let done = {
            let mut states = shared.lock().await;
            let state = &mut states[index];
            state.attempts = attempt;
            state.last_checked_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    state.status = ProbeStatus::Succeeded;
                    state.last_error = None;
                    true
                }
                Err(failure) => {
                    state.last_error = Some(failure.to_string());
                    if !failure.is_retryable() || attempt == config.retry_attempts.max(1) {
                        state.status = ProbeStatus::Failed;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        progress
            .update(HealthCheckProgress {
                status: ProbeStatus::Pending,
                endpoints: shared.lock().await.clone(),
            })
            .await;

        if done {
            return;
        }
        tokio::time::sleep(retry_delay(&backoff, attempt)).await;
    }
}

async fn probe_once(
    client: &reqwest::Client,
    endpoint: &ProbeEndpoint,
    config: &ProbeConfig,
) -> Result<(), ProbeFailure> {
    let response = client
        .get(endpoint.url())
        .timeout(Duration::from_millis(config.timeout_ms))
        .send()
        .await
        .map_err(classify_request_error)?;

    let status = response.status().as_u16();
    let healthy_status = match endpoint.expected_status {
        Some(expected) => status == expected,
        None => (200..300).contains(&status),
    };
    if !healthy_status {
        return Err(ProbeFailure::HttpStatus(status));
    }

    if let Some(indicator) = &config.error_indicator {
        let body = response.text().await.unwrap_or_default();
        if body.contains(indicator.as_str()) {
            return Err(ProbeFailure::BodyRejected);
        }
    }
    Ok(())
}

fn classify_request_error(e: reqwest::Error) -> ProbeFailure {
    if e.is_timeout() {
        return ProbeFailure::Timeout;
    }
    // Walk the source chain for the underlying cause; reqwest flattens
    // connect/tls/dns failures into an opaque "error sending request".
    let description = {
        use std::error::Error;
        let mut parts = vec![e.to_string()];
        let mut source = e.source();
        while let Some(inner) = source {
            parts.push(inner.to_string());
            source = inner.source();
        }
        parts.join(": ").to_lowercase()
    };
    if description.contains("dns") || description.contains("resolve") {
        ProbeFailure::Dns
    } else if description.contains("certificate") || description.contains("tls") {
        ProbeFailure::Tls
    } else {
        ProbeFailure::ConnectionRefused
    }
}
