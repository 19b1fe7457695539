//! Template fetch, validation, and registry-auth resolution.

use std::sync::Arc;

use crate::cache::Cache;
use crate::ports::{ProviderApi, Result};
use crate::types::{validate_template, Template, TemplateConfiguration};

pub struct TemplateResolver {
    provider: Arc<dyn ProviderApi>,
    templates: Cache<Template>,
}

impl TemplateResolver {
    pub fn new(provider: Arc<dyn ProviderApi>, templates: Cache<Template>) -> Self {
        Self {
            provider,
            templates,
        }
    }

    /// Fetch and structurally validate a template. Validated templates are
    /// cached; invalid ones never enter the cache.
    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        if let Some(hit) = self.templates.get(template_id) {
            return Ok(hit);
        }
        let template = self.provider.get_template(template_id).await?;
        validate_template(&template)?;
        self.templates.set(template_id, template.clone());
        Ok(template)
    }

    /// Template plus resolved registry credentials. The credential travels
    /// as an opaque `username:password` string for the provider.
    pub async fn get_template_configuration(
        &self,
        template_id: &str,
    ) -> Result<TemplateConfiguration> {
        let template = self.get_template(template_id).await?;
        let image_auth = match &template.image_auth_id {
            Some(auth_id) => {
                let auth = self.provider.get_registry_auth(auth_id).await?;
                Some(format!("{}:{}", auth.username, auth.password))
            }
            None => None,
        };
        Ok(TemplateConfiguration {
            template,
            image_auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::FleetError;
    use crate::types::{
        CreateInstanceSpec, EnvVar, InstanceListQuery, PortKind, PortMapping, Product,
        ProductQuery, ProviderInstance, RegistryAuth,
    };

    struct ScriptedTemplates {
        template: Template,
        auth: Option<RegistryAuth>,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl ProviderApi for ScriptedTemplates {
        async fn get_template(&self, template_id: &str) -> Result<Template> {
            *self.fetches.lock().unwrap() += 1;
            if template_id == self.template.id {
                Ok(self.template.clone())
            } else {
                Err(FleetError::NotFound(format!("template {template_id}")))
            }
        }

        async fn get_registry_auth(&self, auth_id: &str) -> Result<RegistryAuth> {
            self.auth
                .clone()
                .filter(|a| a.id == auth_id)
                .ok_or_else(|| FleetError::NotFound(format!("registry auth {auth_id}")))
        }

        async fn list_products(&self, _: &ProductQuery) -> Result<Vec<Product>> {
            unimplemented!("not used by template tests")
        }
        async fn create_instance(&self, _: &CreateInstanceSpec) -> Result<ProviderInstance> {
            unimplemented!("not used by template tests")
        }
        async fn start_instance(&self, _: &str) -> Result<()> {
            unimplemented!("not used by template tests")
        }
        async fn stop_instance(&self, _: &str) -> Result<()> {
            unimplemented!("not used by template tests")
        }
        async fn get_instance(&self, _: &str) -> Result<ProviderInstance> {
            unimplemented!("not used by template tests")
        }
        async fn list_instances(&self, _: &InstanceListQuery) -> Result<Vec<ProviderInstance>> {
            unimplemented!("not used by template tests")
        }
        async fn migrate_instance(&self, _: &str) -> Result<ProviderInstance> {
            unimplemented!("not used by template tests")
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn sample_template(auth_id: Option<&str>) -> Template {
        Template {
            id: "tpl-42".into(),
            image_url: "https://registry.example.com/gpu/base:latest".into(),
            image_auth_id: auth_id.map(String::from),
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

    fn resolver(provider: ScriptedTemplates) -> (TemplateResolver, Arc<ScriptedTemplates>) {
        let provider = Arc::new(provider);
        let resolver = TemplateResolver::new(
            provider.clone(),
            Cache::new("templates", 32, Duration::from_secs(600)),
        );
        (resolver, provider)
    }

    #[tokio::test]
    async fn fetches_validates_and_caches() {
        let (resolver, provider) = resolver(ScriptedTemplates {
            template: sample_template(None),
            auth: None,
            fetches: Mutex::new(0),
        });

        let first = resolver.get_template("tpl-42").await.unwrap();
        let second = resolver.get_template("tpl-42").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*provider.fetches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_template_is_rejected_not_cached() {
        let mut bad = sample_template(None);
        bad.image_url = "".into();
        let (resolver, provider) = resolver(ScriptedTemplates {
            template: bad,
            auth: None,
            fetches: Mutex::new(0),
        });

        for _ in 0..2 {
            let err = resolver.get_template("tpl-42").await.unwrap_err();
            assert!(matches!(err, FleetError::Validation(_)));
        }
        // No caching of invalid templates: each call re-fetches.
        assert_eq!(*provider.fetches.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn configuration_resolves_registry_auth() {
        let (resolver, _) = resolver(ScriptedTemplates {
            template: sample_template(Some("auth-1")),
            auth: Some(RegistryAuth {
                id: "auth-1".into(),
                username: "robot".into(),
                password: "s3cret".into(),
            }),
            fetches: Mutex::new(0),
        });

        let config = resolver.get_template_configuration("tpl-42").await.unwrap();
        assert_eq!(config.image_auth.as_deref(), Some("robot:s3cret"));
    }

    #[tokio::test]
    async fn missing_auth_id_surfaces_not_found() {
        let (resolver, _) = resolver(ScriptedTemplates {
            template: sample_template(Some("auth-9")),
            auth: None,
            fetches: Mutex::new(0),
        });
        let err = resolver
            .get_template_configuration("tpl-42")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }
}
