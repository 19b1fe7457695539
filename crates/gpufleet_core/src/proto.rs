//! Request/response DTOs for the public API surface, plus input validation.
//! Wire casing is camelCase; internal types stay snake_case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FieldError, FleetError};
use crate::types::{
    ConnectionInfo, HealthCheckProgress, InstanceStatus, ProviderPortBinding,
};

// ── Create ────────────────────────────────────────────────────

/// Template reference: callers may send a name string or a numeric id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateId {
    Text(String),
    Number(i64),
}

impl TemplateId {
    pub fn normalized(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }

    fn field_error(&self) -> Option<FieldError> {
        match self {
            Self::Text(s) if s.is_empty() => Some(FieldError::new(
                "templateId",
                "must be a non-empty string or positive integer",
            )),
            Self::Number(n) if *n <= 0 => Some(FieldError::new(
                "templateId",
                "must be a non-empty string or positive integer",
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub product_name: String,
    pub template_id: TemplateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_num: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

pub const DEFAULT_GPU_NUM: u32 = 1;
pub const DEFAULT_ROOTFS_SIZE_GB: u32 = 60;

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn valid_http_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

impl CreateInstanceRequest {
    /// Field-level validation per the public API contract. Collects every
    /// failure rather than stopping at the first.
    pub fn validate(&self) -> Result<(), FleetError> {
        let mut errors = Vec::new();

        if self.name.is_empty() || self.name.len() > 100 {
            errors.push(FieldError::new("name", "must be 1..100 characters"));
        } else if !self.name.chars().all(valid_name_char) {
            errors.push(FieldError::new(
                "name",
                "may only contain letters, digits, '_' and '-'",
            ));
        }

        if self.product_name.is_empty() || self.product_name.len() > 200 {
            errors.push(FieldError::new("productName", "must be 1..200 characters"));
        }

        if let Some(e) = self.template_id.field_error() {
            errors.push(e);
        }

        if let Some(gpu_num) = self.gpu_num {
            if !(1..=8).contains(&gpu_num) {
                errors.push(FieldError::new("gpuNum", "must be an integer in 1..=8"));
            }
        }

        if let Some(rootfs) = self.rootfs_size {
            if !(20..=1000).contains(&rootfs) {
                errors.push(FieldError::new(
                    "rootfsSize",
                    "must be an integer in 20..=1000 (GB)",
                ));
            }
        }

        if let Some(webhook) = &self.webhook_url {
            if !valid_http_url(webhook) {
                errors.push(FieldError::new("webhookUrl", "must be a valid http(s) URL"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Validation(errors))
        }
    }

    pub fn gpu_num_or_default(&self) -> u32 {
        self.gpu_num.map(|n| n as u32).unwrap_or(DEFAULT_GPU_NUM)
    }

    pub fn rootfs_size_or_default(&self) -> u32 {
        self.rootfs_size
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_ROOTFS_SIZE_GB)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub estimated_ready_at: DateTime<Utc>,
}

// ── Start / stop ──────────────────────────────────────────────

/// How `start_instance` resolves its identifier argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBy {
    Id,
    Name,
    /// Try local id first, then name.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub operation_id: String,
    pub status: InstanceStatus,
    pub estimated_ready_at: DateTime<Utc>,
}

// ── Comprehensive listing ─────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOpts {
    #[serde(default)]
    pub include_novita_only: bool,
    #[serde(default)]
    pub sync_local_state: bool,
}

impl ListOpts {
    /// Cache key inside the `merged-instances` cache.
    pub fn cache_key(&self) -> String {
        format!(
            "merged:{}:{}",
            self.include_novita_only, self.sync_local_state
        )
    }
}

/// One row of the merged local + provider listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedInstance {
    /// Local id, absent for provider-only rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    pub name: String,
    /// Provider-authoritative lifecycle status when known.
    pub status: String,
    pub ports: Vec<ProviderPortBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckProgress>,
    /// Provider listing was unavailable; row reflects local state only.
    #[serde(default)]
    pub local_only: bool,
    /// Row exists at the provider with no local shadow.
    #[serde(default)]
    pub provider_only: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ListCounts {
    pub local: usize,
    pub upstream: usize,
    pub merged: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPerformance {
    pub total_ms: u64,
    pub upstream_ms: u64,
    pub local_ms: u64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveList {
    pub items: Vec<MergedInstance>,
    pub counts: ListCounts,
    pub performance: ListPerformance,
}

// ── Webhook events ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventKind {
    #[serde(rename = "instance.ready")]
    InstanceReady,
    #[serde(rename = "instance.failed")]
    InstanceFailed,
    #[serde(rename = "instance.migrated")]
    InstanceMigrated,
}

/// Outgoing webhook body delivered to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event: WebhookEventKind,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: "gpu-1".into(),
            product_name: "RTX-4090".into(),
            template_id: TemplateId::Text("tpl-42".into()),
            gpu_num: None,
            rootfs_size: None,
            region: None,
            webhook_url: None,
        }
    }

    #[test]
    fn valid_request_passes_with_defaults() {
        let req = valid_request();
        assert!(req.validate().is_ok());
        assert_eq!(req.gpu_num_or_default(), 1);
        assert_eq!(req.rootfs_size_or_default(), 60);
    }

    #[test]
    fn every_bad_field_is_reported() {
        let req = CreateInstanceRequest {
            name: "bad name!".into(),
            product_name: "".into(),
            template_id: TemplateId::Number(0),
            gpu_num: Some(10),
            rootfs_size: Some(5),
            region: None,
            webhook_url: None,
        };
        let Err(FleetError::Validation(errors)) = req.validate() else {
            panic!("expected validation failure");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["name", "productName", "templateId", "gpuNum", "rootfsSize"]
        );
    }

    #[test]
    fn webhook_url_must_be_http() {
        let mut req = valid_request();
        req.webhook_url = Some("ftp://example.com/hook".into());
        let Err(FleetError::Validation(errors)) = req.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors[0].field, "webhookUrl");
    }

    #[test]
    fn template_id_accepts_string_or_number_on_the_wire() {
        let from_text: CreateInstanceRequest = serde_json::from_str(
            r#"{"name":"a","productName":"p","templateId":"tpl-1"}"#,
        )
        .unwrap();
        assert_eq!(from_text.template_id.normalized(), "tpl-1");

        let from_number: CreateInstanceRequest =
            serde_json::from_str(r#"{"name":"a","productName":"p","templateId":42}"#).unwrap();
        assert_eq!(from_number.template_id.normalized(), "42");
    }

    #[test]
    fn webhook_event_kind_uses_dotted_names() {
        let event = WebhookEvent {
            event: WebhookEventKind::InstanceReady,
            instance_id: "i-1".into(),
            upstream_id: Some("up-1".into()),
            timestamp: Utc::now(),
            details: serde_json::json!({"region": "eu-01"}),
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"event\":\"instance.ready\""));
    }
}
