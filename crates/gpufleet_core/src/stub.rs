//! Scripted in-memory provider for tests.
//!
//! Behaves like a tiny upstream: a product catalog per region, a template
//! store, and an instance table. Individual calls can be scripted to fail
//! with specific HTTP statuses to exercise retry and failure paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::ports::{ProviderApi, Result};
use crate::types::{
    CreateInstanceSpec, InstanceListQuery, PortKind, Product, ProductQuery, ProviderInstance,
    ProviderInstanceStatus, ProviderPortBinding, RegistryAuth, Template,
};

/// Scripted outcome for the next `create_instance` calls; an empty script
/// means "succeed normally".
pub type ScriptedStatus = std::result::Result<(), u16>;

fn status_error(status: u16) -> FleetError {
    if status >= 500 {
        FleetError::Upstream5xx {
            status,
            message: "scripted failure".into(),
        }
    } else {
        FleetError::Upstream4xx {
            status,
            message: "scripted failure".into(),
        }
    }
}

#[derive(Default)]
pub struct StubProvider {
    pub products_by_region: Mutex<HashMap<String, Vec<Product>>>,
    pub templates: Mutex<HashMap<String, Template>>,
    pub auths: Mutex<HashMap<String, RegistryAuth>>,
    pub instances: Mutex<HashMap<String, ProviderInstance>>,
    /// Pre-scripted outcomes consumed by `create_instance`, oldest first.
    pub create_script: Mutex<VecDeque<ScriptedStatus>>,
    /// When set, `list_instances` fails with this status.
    pub list_failure: Mutex<Option<u16>>,
    pub create_calls: AtomicU64,
    next_id: AtomicU64,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_products(&self, region_id: &str, products: Vec<Product>) {
        self.products_by_region
            .lock()
            .unwrap()
            .insert(region_id.to_string(), products);
    }

    pub fn add_template(&self, template: Template) {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id.clone(), template);
    }

    pub fn add_auth(&self, auth: RegistryAuth) {
        self.auths.lock().unwrap().insert(auth.id.clone(), auth);
    }

    pub fn put_instance(&self, instance: ProviderInstance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    pub fn set_instance_status(&self, upstream_id: &str, status: ProviderInstanceStatus) {
        if let Some(i) = self.instances.lock().unwrap().get_mut(upstream_id) {
            i.status = status;
        }
    }

    pub fn script_create(&self, outcomes: Vec<ScriptedStatus>) {
        *self.create_script.lock().unwrap() = outcomes.into();
    }
}

#[async_trait]
impl ProviderApi for StubProvider {
    async fn list_products(&self, query: &ProductQuery) -> Result<Vec<Product>> {
        let region = query.region_id.clone().unwrap_or_default();
        Ok(self
            .products_by_region
            .lock()
            .unwrap()
            .get(&region)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_template(&self, template_id: &str) -> Result<Template> {
        self.templates
            .lock()
            .unwrap()
            .get(template_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("template {template_id}")))
    }

    async fn get_registry_auth(&self, auth_id: &str) -> Result<RegistryAuth> {
        self.auths
            .lock()
            .unwrap()
            .get(auth_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("registry auth {auth_id}")))
    }

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<ProviderInstance> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.create_script.lock().unwrap().pop_front() {
            if let Err(status) = outcome {
                return Err(status_error(status));
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = ProviderInstance {
            id: format!("up-{n}"),
            name: spec.name.clone(),
            status: ProviderInstanceStatus::Creating,
            ports: spec
                .ports
                .iter()
                .map(|p| ProviderPortBinding {
                    port: p.port,
                    kind: p.kind,
                    host: Some("node.stub.example.com".into()),
                    external_port: Some(40000 + p.port % 1000),
                })
                .collect(),
            connection: None,
            reclaim_flagged: false,
            reclaim_reason: None,
        };
        self.put_instance(instance.clone());
        Ok(instance)
    }

    async fn start_instance(&self, upstream_id: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(upstream_id) {
            Some(i) => {
                i.status = ProviderInstanceStatus::Running;
                Ok(())
            }
            None => Err(FleetError::NotFound(format!("instance {upstream_id}"))),
        }
    }

    async fn stop_instance(&self, upstream_id: &str) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(upstream_id) {
            Some(i) => {
                i.status = ProviderInstanceStatus::Exited;
                Ok(())
            }
            None => Err(FleetError::NotFound(format!("instance {upstream_id}"))),
        }
    }

    async fn get_instance(&self, upstream_id: &str) -> Result<ProviderInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(upstream_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("instance {upstream_id}")))
    }

    async fn list_instances(&self, query: &InstanceListQuery) -> Result<Vec<ProviderInstance>> {
        if let Some(status) = *self.list_failure.lock().unwrap() {
            return Err(status_error(status));
        }
        let mut rows: Vec<ProviderInstance> =
            self.instances.lock().unwrap().values().cloned().collect();
        if query.reclaim_flagged_only {
            rows.retain(|r| r.reclaim_flagged);
        }
        if let Some(name) = &query.name {
            rows.retain(|r| &r.name == name);
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn migrate_instance(&self, upstream_id: &str) -> Result<ProviderInstance> {
        let replacement = {
            let mut instances = self.instances.lock().unwrap();
            let Some(old) = instances.get_mut(upstream_id) else {
                return Err(FleetError::NotFound(format!("instance {upstream_id}")));
            };
            old.status = ProviderInstanceStatus::Exited;
            old.reclaim_flagged = false;
            let mut replacement = old.clone();
            replacement.id = format!("{upstream_id}-m");
            replacement.status = ProviderInstanceStatus::Creating;
            replacement
        };
        self.put_instance(replacement.clone());
        Ok(replacement)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// A plain http probe port used by many tests.
pub fn http_port(port: u16) -> crate::types::PortMapping {
    crate::types::PortMapping {
        port,
        kind: PortKind::Http,
    }
}
