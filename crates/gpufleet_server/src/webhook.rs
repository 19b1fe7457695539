//! Webhook deliverer — HMAC-signed POSTs with bounded retries.
//!
//! At-least-once semantics: the deliverer retries transient failures itself
//! (three attempts, doubling delay); a still-transient outcome is handed back
//! as `Retryable` so the job layer can nack and try again later under the
//! queue's own backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use gpufleet_core::error::FleetError;
use gpufleet_core::ports::Result;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Final classification handed to the job worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient (network / 5xx) even after in-process retries.
    Retryable { reason: String },
    /// The receiver rejected the delivery (4xx); never retried.
    Terminal { status: u16, reason: String },
}

#[derive(Clone)]
pub struct WebhookConfig {
    /// Per-request deadline, clamped to [1 s, 30 s].
    pub timeout: Duration,
    /// HMAC secret; unsigned deliveries when absent.
    pub secret: Option<String>,
    /// In-process attempts (first try + retries).
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt (1 s → 2 s → 4 s).
    pub retry_base: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            secret: None,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

pub struct WebhookDeliverer {
    client: reqwest::Client,
    cfg: WebhookConfig,
}

/// `sha256=<hex HMAC-SHA256(secret, body)>`, reproducible by the receiver.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

impl WebhookDeliverer {
    pub fn new(cfg: WebhookConfig) -> Result<Self> {
        let timeout = cfg
            .timeout
            .clamp(Duration::from_secs(1), Duration::from_secs(30));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Configuration(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            cfg: WebhookConfig { timeout, ..cfg },
        })
    }

    /// Deliver one JSON payload. `request_id` is the idempotency token the
    /// receiver can dedup on; job retries reuse the same id.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
        request_id: &str,
        extra_headers: Option<&BTreeMap<String, String>>,
    ) -> DeliveryOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome::Terminal {
                    status: 0,
                    reason: format!("unserializable payload: {e}"),
                }
            }
        };

        let mut last_reason = String::new();
        for attempt in 1..=self.cfg.max_attempts {
            match self.send_once(url, &body, request_id, extra_headers).await {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(SendError::Terminal { status, reason }) => {
                    return DeliveryOutcome::Terminal { status, reason }
                }
                Err(SendError::Retryable(reason)) => {
                    tracing::debug!(url, attempt, reason = %reason, "webhook delivery failed");
                    last_reason = reason;
                    if attempt < self.cfg.max_attempts {
                        let delay = self.cfg.retry_base * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        DeliveryOutcome::Retryable {
            reason: last_reason,
        }
    }

    async fn send_once(
        &self,
        url: &str,
        body: &[u8],
        request_id: &str,
        extra_headers: Option<&BTreeMap<String, String>>,
    ) -> std::result::Result<(), SendError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, request_id)
            .body(body.to_vec());
        if let Some(secret) = &self.cfg.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, body));
        }
        if let Some(headers) = extra_headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(|e| {
            SendError::Retryable(if e.is_timeout() {
                "webhook request timed out".into()
            } else {
                "webhook request failed to send".into()
            })
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(SendError::Terminal {
                status: status.as_u16(),
                reason: format!("receiver rejected delivery with {status}"),
            })
        } else {
            Err(SendError::Retryable(format!("receiver answered {status}")))
        }
    }
}

enum SendError {
    Retryable(String),
    Terminal { status: u16, reason: String },
}
