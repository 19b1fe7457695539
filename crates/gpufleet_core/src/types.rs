//! Core domain types for the GPU fleet control plane.
//! Pure value types — no redis, no HTTP dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

// ── Instance lifecycle ────────────────────────────────────────

/// Instance lifecycle status — the single source of truth state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Starting,
    HealthChecking,
    Ready,
    Stopping,
    Exited,
    Failed,
    Migrating,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Starting => "STARTING",
            Self::HealthChecking => "HEALTH_CHECKING",
            Self::Ready => "READY",
            Self::Stopping => "STOPPING",
            Self::Exited => "EXITED",
            Self::Failed => "FAILED",
            Self::Migrating => "MIGRATING",
        }
    }

    /// Steady states that are never auto-failed by monitors.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Exited | Self::Failed)
    }

    /// Whether the lifecycle diagram permits `self -> to`.
    ///
    /// Any state may enter `Migrating` on an operator migration request; a
    /// migrating record either follows the replacement instance back through
    /// `Starting` or settles in `Exited`/`Failed`.
    pub fn can_transition(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if to == Migrating {
            return *self != Migrating;
        }
        match (self, to) {
            (Creating, Starting) | (Creating, Failed) => true,
            (Starting, HealthChecking) | (Starting, Failed) => true,
            (HealthChecking, Ready) | (HealthChecking, Failed) => true,
            (Ready, Stopping) => true,
            (Stopping, Exited) | (Stopping, Failed) => true,
            (Exited, Starting) => true,
            (Migrating, Starting) | (Migrating, Exited) | (Migrating, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exposed port kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Tcp,
    Http,
    Https,
}

impl PortKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// One exposed port on an instance or template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: PortKind,
}

/// Environment variable injected into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Connection endpoints populated once the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jupyter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_terminal: Option<String>,
}

impl ConnectionInfo {
    pub fn is_empty(&self) -> bool {
        self.ssh.is_none() && self.jupyter.is_none() && self.web_terminal.is_none()
    }
}

/// Authoritative per-managed-instance record.
///
/// Owned exclusively by the instance state store; every mutation flows
/// through `InstanceStateStore::update` and stamps `last_updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: String,
    pub upstream_id: Option<String>,
    pub name: String,
    pub status: InstanceStatus,
    pub product_id: String,
    pub region: String,
    pub gpu_num: u32,
    pub rootfs_size: u32,
    pub template_id: String,
    pub ports: Vec<PortMapping>,
    pub envs: Vec<EnvVar>,
    pub connection: Option<ConnectionInfo>,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub health_check: Option<HealthCheckProgress>,
    pub startup_operation_id: Option<String>,
    pub webhook_url: Option<String>,
    pub last_error: Option<String>,
}

impl InstanceState {
    /// Fresh record in `Creating`, before the provider has acked anything.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        product_id: impl Into<String>,
        region: impl Into<String>,
        template_id: impl Into<String>,
        gpu_num: u32,
        rootfs_size: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            upstream_id: None,
            name: name.into(),
            status: InstanceStatus::Creating,
            product_id: product_id.into(),
            region: region.into(),
            gpu_num,
            rootfs_size,
            template_id: template_id.into(),
            ports: Vec::new(),
            envs: Vec::new(),
            connection: None,
            created_at: now,
            ready_at: None,
            started_at: None,
            stopped_at: None,
            failed_at: None,
            last_updated_at: now,
            health_check: None,
            startup_operation_id: None,
            webhook_url: None,
            last_error: None,
        }
    }
}

// ── Readiness probing ─────────────────────────────────────────

/// One HTTP endpoint the readiness prober must see healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: PortKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
}

impl ProbeEndpoint {
    pub fn url(&self) -> String {
        let scheme = match self.protocol {
            PortKind::Https => "https",
            _ => "http",
        };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

impl std::fmt::Display for ProbeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

/// Probe behavior knobs, carried inside `HEALTH_CHECK` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_wait_ms: u64,
    /// Substring that marks an otherwise-2xx body as unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_indicator: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_attempts: 5,
            retry_delay_ms: 2_000,
            max_wait_ms: 300_000,
            error_indicator: None,
        }
    }
}

/// Per-endpoint probe outcome so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Progress of one endpoint within a health check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointProbeState {
    pub endpoint: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub status: ProbeStatus,
}

/// Overall probing progress written into `InstanceState.health_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckProgress {
    pub status: ProbeStatus,
    pub endpoints: Vec<EndpointProbeState>,
}

// ── Catalog ───────────────────────────────────────────────────

/// A rentable hardware product in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub region: String,
    pub spot_price_usd_per_hour: f64,
    pub availability: bool,
}

/// Named instance template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_auth_id: Option<String>,
    pub ports: Vec<PortMapping>,
    pub envs: Vec<EnvVar>,
}

/// Template plus resolved registry credentials, ready to hand to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfiguration {
    pub template: Template,
    /// `username:password`, passed opaquely to the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
}

/// Region with selection priority; lower value is tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub name: String,
    pub priority: i32,
}

/// Stored registry credential as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub id: String,
    pub username: String,
    pub password: String,
}

// ── Provider-side views ───────────────────────────────────────

/// Lifecycle status as reported by the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderInstanceStatus {
    Creating,
    Pulling,
    Running,
    Exited,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ProviderInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Pulling => "pulling",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// One exposed port binding as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPortBinding {
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: PortKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

/// Provider's view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: String,
    pub name: String,
    pub status: ProviderInstanceStatus,
    #[serde(default)]
    pub ports: Vec<ProviderPortBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
    /// Set when the provider has flagged this spot instance for reclamation.
    #[serde(default)]
    pub reclaim_flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_reason: Option<String>,
}

impl ProviderInstance {
    /// Probe endpoints for every http(s) binding with a routable address.
    pub fn probe_endpoints(&self) -> Vec<ProbeEndpoint> {
        self.ports
            .iter()
            .filter(|b| matches!(b.kind, PortKind::Http | PortKind::Https))
            .filter_map(|b| {
                let host = b.host.clone()?;
                Some(ProbeEndpoint {
                    host,
                    port: b.external_port.unwrap_or(b.port),
                    path: "/".to_string(),
                    protocol: b.kind,
                    expected_status: None,
                })
            })
            .collect()
    }
}

/// Query for `list_products`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductQuery {
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
}

/// Query for `list_instances`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceListQuery {
    /// Restrict to instances the provider flagged for spot reclamation.
    pub reclaim_flagged_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Creation spec handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceSpec {
    pub name: String,
    pub product_id: String,
    pub gpu_num: u32,
    pub rootfs_size: u32,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
    pub ports: Vec<PortMapping>,
    pub envs: Vec<EnvVar>,
}

/// Instance flagged for migration off reclaimed spot capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCandidate {
    pub instance_id: Option<String>,
    pub upstream_id: String,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

// ── Validation helpers ────────────────────────────────────────

/// Structural template validation shared by the resolver and tests.
pub fn validate_template(template: &Template) -> Result<(), FleetError> {
    let mut errors = Vec::new();
    if template.id.is_empty() {
        errors.push(crate::error::FieldError::new("id", "must be non-empty"));
    }
    if template.image_url.is_empty() || url::Url::parse(&template.image_url).is_err() {
        errors.push(crate::error::FieldError::new(
            "imageUrl",
            "must be a valid URL",
        ));
    }
    for (i, p) in template.ports.iter().enumerate() {
        if p.port == 0 {
            errors.push(crate::error::FieldError::new(
                format!("ports[{i}].port"),
                "must be in 1..=65535",
            ));
        }
    }
    for (i, e) in template.envs.iter().enumerate() {
        if e.key.is_empty() || !e.key.is_ascii() {
            errors.push(crate::error::FieldError::new(
                format!("envs[{i}].key"),
                "must be non-empty ASCII",
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_accepts_diagram_transitions() {
        use InstanceStatus::*;
        assert!(Creating.can_transition(Starting));
        assert!(Starting.can_transition(HealthChecking));
        assert!(HealthChecking.can_transition(Ready));
        assert!(Ready.can_transition(Stopping));
        assert!(Stopping.can_transition(Exited));
        assert!(Exited.can_transition(Starting));
        assert!(Creating.can_transition(Failed));
        assert!(Ready.can_transition(Migrating));
        assert!(Failed.can_transition(Migrating));
        assert!(Migrating.can_transition(Exited));
        assert!(Migrating.can_transition(Starting));
    }

    #[test]
    fn lifecycle_rejects_out_of_diagram_transitions() {
        use InstanceStatus::*;
        assert!(!Creating.can_transition(Ready));
        assert!(!Ready.can_transition(Starting));
        assert!(!Exited.can_transition(Ready));
        assert!(!Failed.can_transition(Starting));
        assert!(!Ready.can_transition(Failed));
        assert!(!Exited.can_transition(Failed));
        assert!(!Migrating.can_transition(Migrating));
    }

    #[test]
    fn probe_endpoints_skip_tcp_and_hostless_bindings() {
        let instance = ProviderInstance {
            id: "up-1".into(),
            name: "gpu-1".into(),
            status: ProviderInstanceStatus::Running,
            ports: vec![
                ProviderPortBinding {
                    port: 22,
                    kind: PortKind::Tcp,
                    host: Some("n1.example.com".into()),
                    external_port: Some(40022),
                },
                ProviderPortBinding {
                    port: 8888,
                    kind: PortKind::Http,
                    host: Some("n1.example.com".into()),
                    external_port: Some(40888),
                },
                ProviderPortBinding {
                    port: 8080,
                    kind: PortKind::Http,
                    host: None,
                    external_port: None,
                },
            ],
            connection: None,
            reclaim_flagged: false,
            reclaim_reason: None,
        };
        let eps = instance.probe_endpoints();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].port, 40888);
        assert_eq!(eps[0].url(), "http://n1.example.com:40888/");
    }

    #[test]
    fn template_validation_flags_bad_fields() {
        let template = Template {
            id: "".into(),
            image_url: "not a url".into(),
            image_auth_id: None,
            ports: vec![PortMapping {
                port: 0,
                kind: PortKind::Http,
            }],
            envs: vec![EnvVar {
                key: "".into(),
                value: "x".into(),
            }],
        };
        match validate_template(&template) {
            Err(FleetError::Validation(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }
}
