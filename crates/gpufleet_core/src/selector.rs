//! Multi-region optimal product selection with per-region fallback.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::{FleetError, RegionFailure};
use crate::ports::{ProviderApi, Result};
use crate::types::{Product, ProductQuery, RegionConfig};

/// Winning product plus the region it was found in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalProduct {
    pub product: Product,
    pub region_used: String,
}

pub struct ProductSelector {
    provider: Arc<dyn ProviderApi>,
    products: Cache<Vec<Product>>,
    optimal: Cache<OptimalProduct>,
}

impl ProductSelector {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        products: Cache<Vec<Product>>,
        optimal: Cache<OptimalProduct>,
    ) -> Self {
        Self {
            provider,
            products,
            optimal,
        }
    }

    fn optimal_key(product_name: &str, region: &str) -> String {
        format!("{product_name}@{region}")
    }

    /// Cheapest available product for `product_name`, trying regions in
    /// priority order (preferred region first when given). Regions that fail
    /// or have no availability contribute a note; if every region fails the
    /// notes travel in `NoOptimalProduct`.
    pub async fn optimal_product_with_fallback(
        &self,
        product_name: &str,
        preferred_region: Option<&str>,
        regions: &[RegionConfig],
    ) -> Result<OptimalProduct> {
        let mut ordered: Vec<&RegionConfig> = regions.iter().collect();
        ordered.sort_by_key(|r| r.priority);
        if let Some(preferred) = preferred_region {
            if let Some(pos) = ordered.iter().position(|r| r.name == preferred) {
                let front = ordered.remove(pos);
                ordered.insert(0, front);
            }
        }

        let mut failures: Vec<RegionFailure> = Vec::new();
        for region in ordered {
            let key = Self::optimal_key(product_name, &region.name);
            if let Some(hit) = self.optimal.get(&key) {
                return Ok(hit);
            }
            match self.probe_region(product_name, region).await {
                Ok(Some(product)) => {
                    let winner = OptimalProduct {
                        product,
                        region_used: region.name.clone(),
                    };
                    self.optimal.set(key, winner.clone());
                    return Ok(winner);
                }
                Ok(None) => {
                    failures.push(RegionFailure {
                        region: region.name.clone(),
                        reason: "no available products".into(),
                    });
                }
                Err(e) => {
                    tracing::warn!(region = %region.name, error = %e, "region lookup failed");
                    failures.push(RegionFailure {
                        region: region.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Err(FleetError::NoOptimalProduct(failures))
    }

    async fn probe_region(
        &self,
        product_name: &str,
        region: &RegionConfig,
    ) -> Result<Option<Product>> {
        let cache_key = Self::optimal_key(product_name, &region.id);
        let listed = match self.products.get(&cache_key) {
            Some(hit) => hit,
            None => {
                let fetched = self
                    .provider
                    .list_products(&ProductQuery {
                        product_name: product_name.to_string(),
                        region_id: Some(region.id.clone()),
                    })
                    .await?;
                self.products.set(cache_key, fetched.clone());
                fetched
            }
        };
        Ok(pick_cheapest(listed))
    }
}

/// Cheapest available product; price ties broken by product id so the
/// choice is deterministic.
fn pick_cheapest(mut products: Vec<Product>) -> Option<Product> {
    products.retain(|p| p.availability);
    products.sort_by(|a, b| {
        a.spot_price_usd_per_hour
            .partial_cmp(&b.spot_price_usd_per_hour)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    products.into_iter().next()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{
        CreateInstanceSpec, InstanceListQuery, ProviderInstance, RegistryAuth, Template,
    };

    /// Scripted provider: products per region id, plus a call log.
    #[derive(Default)]
    struct ScriptedCatalog {
        by_region: HashMap<String, Vec<Product>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderApi for ScriptedCatalog {
        async fn list_products(&self, query: &ProductQuery) -> Result<Vec<Product>> {
            let region = query.region_id.clone().unwrap_or_default();
            self.calls.lock().unwrap().push(region.clone());
            Ok(self.by_region.get(&region).cloned().unwrap_or_default())
        }

        async fn get_template(&self, _: &str) -> Result<Template> {
            unimplemented!("not used by selector tests")
        }
        async fn get_registry_auth(&self, _: &str) -> Result<RegistryAuth> {
            unimplemented!("not used by selector tests")
        }
        async fn create_instance(&self, _: &CreateInstanceSpec) -> Result<ProviderInstance> {
            unimplemented!("not used by selector tests")
        }
        async fn start_instance(&self, _: &str) -> Result<()> {
            unimplemented!("not used by selector tests")
        }
        async fn stop_instance(&self, _: &str) -> Result<()> {
            unimplemented!("not used by selector tests")
        }
        async fn get_instance(&self, _: &str) -> Result<ProviderInstance> {
            unimplemented!("not used by selector tests")
        }
        async fn list_instances(&self, _: &InstanceListQuery) -> Result<Vec<ProviderInstance>> {
            unimplemented!("not used by selector tests")
        }
        async fn migrate_instance(&self, _: &str) -> Result<ProviderInstance> {
            unimplemented!("not used by selector tests")
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn product(id: &str, region: &str, price: f64, available: bool) -> Product {
        Product {
            id: id.into(),
            name: "RTX-4090".into(),
            region: region.into(),
            spot_price_usd_per_hour: price,
            availability: available,
        }
    }

    fn regions() -> Vec<RegionConfig> {
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
            RegionConfig {
                id: "r3".into(),
                name: "ap-01".into(),
                priority: 3,
            },
        ]
    }

    fn selector(catalog: ScriptedCatalog) -> (ProductSelector, Arc<ScriptedCatalog>) {
        let provider = Arc::new(catalog);
        let selector = ProductSelector::new(
            provider.clone(),
            Cache::new("products", 32, Duration::from_secs(300)),
            Cache::new("optimal-products", 32, Duration::from_secs(300)),
        );
        (selector, provider)
    }

    #[tokio::test]
    async fn falls_through_to_second_region_and_stops() {
        let mut catalog = ScriptedCatalog::default();
        catalog.by_region.insert("r1".into(), vec![]);
        catalog.by_region.insert(
            "r2".into(),
            vec![
                product("p1", "us-01", 2.0, true),
                product("p2", "us-01", 1.0, true),
            ],
        );
        catalog
            .by_region
            .insert("r3".into(), vec![product("p9", "ap-01", 0.5, true)]);

        let (selector, provider) = selector(catalog);
        let winner = selector
            .optimal_product_with_fallback("RTX-4090", None, &regions())
            .await
            .unwrap();

        // Cheapest product from the first region with availability; the
        // third region is never queried.
        assert_eq!(winner.product.id, "p2");
        assert_eq!(winner.region_used, "us-01");
        assert_eq!(*provider.calls.lock().unwrap(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn unavailable_products_are_filtered_out() {
        let mut catalog = ScriptedCatalog::default();
        catalog.by_region.insert(
            "r1".into(),
            vec![
                product("cheap-but-gone", "eu-01", 0.1, false),
                product("actual", "eu-01", 1.5, true),
            ],
        );
        let (selector, _) = selector(catalog);
        let winner = selector
            .optimal_product_with_fallback("RTX-4090", None, &regions()[..1])
            .await
            .unwrap();
        assert_eq!(winner.product.id, "actual");
    }

    #[tokio::test]
    async fn price_ties_break_by_product_id() {
        let mut catalog = ScriptedCatalog::default();
        catalog.by_region.insert(
            "r1".into(),
            vec![
                product("b-prod", "eu-01", 1.0, true),
                product("a-prod", "eu-01", 1.0, true),
            ],
        );
        let (selector, _) = selector(catalog);
        let winner = selector
            .optimal_product_with_fallback("RTX-4090", None, &regions()[..1])
            .await
            .unwrap();
        assert_eq!(winner.product.id, "a-prod");
    }

    #[tokio::test]
    async fn preferred_region_jumps_the_priority_order() {
        let mut catalog = ScriptedCatalog::default();
        catalog
            .by_region
            .insert("r1".into(), vec![product("eu", "eu-01", 1.0, true)]);
        catalog
            .by_region
            .insert("r3".into(), vec![product("ap", "ap-01", 9.0, true)]);

        let (selector, provider) = selector(catalog);
        let winner = selector
            .optimal_product_with_fallback("RTX-4090", Some("ap-01"), &regions())
            .await
            .unwrap();
        assert_eq!(winner.region_used, "ap-01");
        assert_eq!(provider.calls.lock().unwrap().first().unwrap(), "r3");
    }

    #[tokio::test]
    async fn exhausting_all_regions_reports_each_failure() {
        let catalog = ScriptedCatalog::default();
        let (selector, _) = selector(catalog);
        let err = selector
            .optimal_product_with_fallback("RTX-4090", None, &regions())
            .await
            .unwrap_err();
        let FleetError::NoOptimalProduct(failures) = err else {
            panic!("expected NoOptimalProduct");
        };
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0].region, "eu-01");
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let mut catalog = ScriptedCatalog::default();
        catalog
            .by_region
            .insert("r1".into(), vec![product("p", "eu-01", 1.0, true)]);
        let (selector, provider) = selector(catalog);

        for _ in 0..3 {
            selector
                .optimal_product_with_fallback("RTX-4090", None, &regions()[..1])
                .await
                .unwrap();
        }
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }
}
