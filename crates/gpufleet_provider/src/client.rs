//! HTTP client for the upstream provider REST API.
//!
//! Wire DTOs stay private to this module; every public signature speaks the
//! core domain types. Error bodies are mapped onto the domain taxonomy by
//! HTTP status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use gpufleet_core::error::FleetError;
use gpufleet_core::job::{retry_delay, BackoffConfig};
use gpufleet_core::ports::{ProviderApi, Result};
use gpufleet_core::types::{
    ConnectionInfo, CreateInstanceSpec, EnvVar, InstanceListQuery, PortKind, PortMapping, Product,
    ProductQuery, ProviderInstance, ProviderInstanceStatus, ProviderPortBinding, RegistryAuth,
    Template,
};

use crate::breaker::{BreakerConfig, CircuitBreaker};

#[derive(Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub max_retry_attempts: u32,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.novita.ai".into(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

// The API key must never reach logs, even through {:?}.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("request_timeout", &self.request_timeout)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .finish()
    }
}

pub struct NovitaClient {
    cfg: ProviderConfig,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl NovitaClient {
    pub fn new(cfg: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| FleetError::Configuration(format!("http client: {e}")))?;
        let breaker = CircuitBreaker::new(cfg.breaker.clone());
        Ok(Self {
            cfg,
            client,
            breaker,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    /// One attempt: send, map the response onto the error taxonomy.
    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.cfg.api_key);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FleetError::Timeout(format!("provider call to {path}"))
            } else {
                // reqwest errors can embed the URL; keep only the path.
                FleetError::Network(format!("provider call to {path} failed"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| FleetError::Serialization(format!("provider response: {e}")));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = extract_message(response.text().await.unwrap_or_default());

        Err(match status {
            StatusCode::NOT_FOUND => FleetError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => FleetError::RateLimit { retry_after },
            StatusCode::REQUEST_TIMEOUT => FleetError::Timeout(message),
            s if s.is_client_error() => FleetError::Upstream4xx {
                status: s.as_u16(),
                message,
            },
            s => FleetError::Upstream5xx {
                status: s.as_u16(),
                message,
            },
        })
    }

    /// Retry wrapper: transient failures back off exponentially (rate-limit
    /// hints win over computed delay) and feed the endpoint-group breaker.
    async fn execute<T: DeserializeOwned>(
        &self,
        group: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        self.breaker.check(group)?;
        let mut attempt = 1;
        loop {
            match self
                .send_once::<T>(method.clone(), path, query, body.as_ref())
                .await
            {
                Ok(value) => {
                    self.breaker.record_success(group);
                    return Ok(value);
                }
                Err(e) => {
                    let upstream_unhealthy = matches!(
                        e,
                        FleetError::Timeout(_)
                            | FleetError::Network(_)
                            | FleetError::Upstream5xx { .. }
                    );
                    if upstream_unhealthy {
                        self.breaker.record_failure(group);
                    }
                    if e.is_retryable() && attempt < self.cfg.max_retry_attempts {
                        let delay = match &e {
                            FleetError::RateLimit {
                                retry_after: Some(hint),
                            } => *hint,
                            _ => retry_delay(&self.cfg.backoff, attempt),
                        };
                        tracing::debug!(
                            group,
                            path,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "provider call failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        self.breaker.check(group)?;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn extract_message(body: String) -> String {
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or(body)
}

// ── Wire format ───────────────────────────────────────────────

#[derive(Deserialize)]
struct ProductsResponse {
    products: Vec<WireProduct>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProduct {
    id: String,
    name: String,
    region: String,
    spot_price: f64,
    available: bool,
}

impl From<WireProduct> for Product {
    fn from(w: WireProduct) -> Self {
        Product {
            id: w.id,
            name: w.name,
            region: w.region,
            spot_price_usd_per_hour: w.spot_price,
            availability: w.available,
        }
    }
}

#[derive(Deserialize)]
struct TemplateResponse {
    template: WireTemplate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTemplate {
    id: String,
    image_url: String,
    #[serde(default)]
    image_auth_id: Option<String>,
    #[serde(default)]
    ports: Vec<WirePort>,
    #[serde(default)]
    envs: Vec<EnvVar>,
}

impl From<WireTemplate> for Template {
    fn from(w: WireTemplate) -> Self {
        Template {
            id: w.id,
            image_url: w.image_url,
            image_auth_id: w.image_auth_id,
            ports: w
                .ports
                .into_iter()
                .map(|p| PortMapping {
                    port: p.port,
                    kind: p.kind,
                })
                .collect(),
            envs: w.envs,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WirePort {
    port: u16,
    #[serde(rename = "type")]
    kind: PortKind,
}

#[derive(Deserialize)]
struct AuthsResponse {
    auths: Vec<WireAuth>,
}

#[derive(Deserialize)]
struct WireAuth {
    id: String,
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct InstanceResponse {
    instance: WireInstance,
}

#[derive(Deserialize)]
struct InstancesResponse {
    instances: Vec<WireInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstance {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    port_mappings: Vec<WirePortBinding>,
    #[serde(default)]
    connection: Option<WireConnection>,
    #[serde(default)]
    spot_reclaim_flag: bool,
    #[serde(default)]
    reclaim_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePortBinding {
    port: u16,
    #[serde(rename = "type")]
    kind: PortKind,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    external_port: Option<u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConnection {
    #[serde(default)]
    ssh: Option<String>,
    #[serde(default)]
    jupyter: Option<String>,
    #[serde(default)]
    web_terminal: Option<String>,
}

fn map_status(status: &str) -> ProviderInstanceStatus {
    match status {
        "creating" => ProviderInstanceStatus::Creating,
        "pulling" => ProviderInstanceStatus::Pulling,
        "running" => ProviderInstanceStatus::Running,
        "exited" => ProviderInstanceStatus::Exited,
        "failed" => ProviderInstanceStatus::Failed,
        _ => ProviderInstanceStatus::Unknown,
    }
}

impl From<WireInstance> for ProviderInstance {
    fn from(w: WireInstance) -> Self {
        ProviderInstance {
            status: map_status(&w.status),
            id: w.id,
            name: w.name,
            ports: w
                .port_mappings
                .into_iter()
                .map(|p| ProviderPortBinding {
                    port: p.port,
                    kind: p.kind,
                    host: p.host,
                    external_port: p.external_port,
                })
                .collect(),
            connection: w.connection.map(|c| ConnectionInfo {
                ssh: c.ssh,
                jupyter: c.jupyter,
                web_terminal: c.web_terminal,
            }),
            reclaim_flagged: w.spot_reclaim_flag,
            reclaim_reason: w.reclaim_reason,
        }
    }
}

fn create_body(spec: &CreateInstanceSpec) -> serde_json::Value {
    serde_json::json!({
        "name": spec.name,
        "productId": spec.product_id,
        "gpuNum": spec.gpu_num,
        "rootfsSize": spec.rootfs_size,
        "imageUrl": spec.image_url,
        "imageAuth": spec.image_auth,
        "ports": spec.ports.iter().map(|p| serde_json::json!({
            "port": p.port,
            "type": p.kind.as_str(),
        })).collect::<Vec<_>>(),
        "envs": spec.envs,
    })
}

// ── ProviderApi ───────────────────────────────────────────────

#[async_trait]
impl ProviderApi for NovitaClient {
    async fn list_products(&self, query: &ProductQuery) -> Result<Vec<Product>> {
        let mut params = vec![("productName", query.product_name.clone())];
        if let Some(region) = &query.region_id {
            params.push(("regionId", region.clone()));
        }
        let response: ProductsResponse = self
            .execute("products", Method::GET, "/v1/products", &params, None)
            .await?;
        Ok(response.products.into_iter().map(Into::into).collect())
    }

    async fn get_template(&self, template_id: &str) -> Result<Template> {
        let response: TemplateResponse = self
            .execute(
                "templates",
                Method::GET,
                &format!("/v1/templates/{template_id}"),
                &[],
                None,
            )
            .await?;
        Ok(response.template.into())
    }

    async fn get_registry_auth(&self, auth_id: &str) -> Result<RegistryAuth> {
        // The provider only exposes the full credential list.
        let response: AuthsResponse = self
            .execute("auth", Method::GET, "/v1/repository/auths", &[], None)
            .await?;
        response
            .auths
            .into_iter()
            .find(|a| a.id == auth_id)
            .map(|a| RegistryAuth {
                id: a.id,
                username: a.username,
                password: a.password,
            })
            .ok_or_else(|| FleetError::NotFound(format!("registry auth {auth_id}")))
    }

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<ProviderInstance> {
        let response: InstanceResponse = self
            .execute(
                "instances",
                Method::POST,
                "/v1/instances",
                &[],
                Some(create_body(spec)),
            )
            .await?;
        Ok(response.instance.into())
    }

    async fn start_instance(&self, upstream_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .execute(
                "instances",
                Method::POST,
                &format!("/v1/instances/{upstream_id}/start"),
                &[],
                None,
            )
            .await?;
        Ok(())
    }

    async fn stop_instance(&self, upstream_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .execute(
                "instances",
                Method::POST,
                &format!("/v1/instances/{upstream_id}/stop"),
                &[],
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_instance(&self, upstream_id: &str) -> Result<ProviderInstance> {
        let response: InstanceResponse = self
            .execute(
                "instances",
                Method::GET,
                &format!("/v1/instances/{upstream_id}"),
                &[],
                None,
            )
            .await?;
        Ok(response.instance.into())
    }

    async fn list_instances(&self, query: &InstanceListQuery) -> Result<Vec<ProviderInstance>> {
        let mut params = Vec::new();
        if query.reclaim_flagged_only {
            params.push(("spotReclaim", "true".to_string()));
        }
        if let Some(name) = &query.name {
            params.push(("name", name.clone()));
        }
        let response: InstancesResponse = self
            .execute("instances", Method::GET, "/v1/instances", &params, None)
            .await?;
        Ok(response.instances.into_iter().map(Into::into).collect())
    }

    async fn migrate_instance(&self, upstream_id: &str) -> Result<ProviderInstance> {
        let response: InstanceResponse = self
            .execute(
                "instances",
                Method::POST,
                &format!("/v1/instances/{upstream_id}/migrate"),
                &[],
                None,
            )
            .await?;
        Ok(response.instance.into())
    }

    async fn ping(&self) -> Result<()> {
        let _: serde_json::Value = self
            .execute("ping", Method::GET, "/v1/ping", &[], None)
            .await?;
        Ok(())
    }
}
