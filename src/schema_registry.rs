use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::composition::{FederatedSchema, compose};
use crate::config::SupergraphConfig;
use crate::error::GatewayError;
use crate::{ServiceConfig, ServiceMap};

#[async_trait]
pub trait SchemaRegistry {
    async fn register_service(&mut self, service: ServiceConfig) -> Result<(), GatewayError>;
    async fn get_schema(&self) -> Result<Arc<FederatedSchema>, GatewayError>;
    /// Swaps in new SDL for the given services if, and only if, the result
    /// still composes. Returns whether anything changed.
    async fn replace_services(&mut self, services: Vec<ServiceConfig>) -> Result<bool, GatewayError>;
    async fn services(&self) -> ServiceMap;
}

pub struct InMemorySchemaRegistry {
    services: Arc<RwLock<ServiceMap>>,
    federated_schema: Arc<RwLock<Option<Arc<FederatedSchema>>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        InMemorySchemaRegistry {
            services: Arc::new(RwLock::new(BTreeMap::new())),
            federated_schema: Arc::new(RwLock::new(None)),
        }
    }

    fn build_federated_schema(services: &ServiceMap) -> Result<FederatedSchema, GatewayError> {
        if services.is_empty() {
            return Err(GatewayError::NoSubgraphs);
        }
        let schema = compose(services)?;
        debug!(
            services = services.len(),
            types = schema.types.len(),
            "composed supergraph"
        );
        Ok(schema)
    }
}

impl Default for InMemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(&mut self, service: ServiceConfig) -> Result<(), GatewayError> {
        let mut services = self.services.write().await;
        services.insert(service.name.clone(), service);

        let mut federated_schema = self.federated_schema.write().await;
        *federated_schema = None;

        Ok(())
    }

    async fn get_schema(&self) -> Result<Arc<FederatedSchema>, GatewayError> {
        let cached_schema = self.federated_schema.read().await;
        if let Some(schema) = &*cached_schema {
            return Ok(schema.clone());
        }
        drop(cached_schema);

        let services = self.services.read().await;
        let schema = Arc::new(Self::build_federated_schema(&services)?);

        let mut federated_schema = self.federated_schema.write().await;
        *federated_schema = Some(schema.clone());

        Ok(schema)
    }

    async fn replace_services(&mut self, replacements: Vec<ServiceConfig>) -> Result<bool, GatewayError> {
        let mut services = self.services.write().await;
        let mut candidate = services.clone();
        for service in replacements {
            candidate.insert(service.name.clone(), service);
        }
        if candidate == *services {
            return Ok(false);
        }

        // The running composition keeps serving until the candidate is known good.
        let schema = Self::build_federated_schema(&candidate)?;
        *services = candidate;
        *self.federated_schema.write().await = Some(Arc::new(schema));
        Ok(true)
    }

    async fn services(&self) -> ServiceMap {
        self.services.read().await.clone()
    }
}

/// Where a subgraph's SDL comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaSource {
    File(PathBuf),
    /// `{ _service { sdl } }` against the routing URL.
    Introspection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphSource {
    pub name: String,
    pub url: String,
    pub source: SchemaSource,
}

impl SubgraphSource {
    pub fn from_config(config: &SupergraphConfig) -> Vec<SubgraphSource> {
        config
            .subgraphs
            .iter()
            .map(|(name, subgraph)| SubgraphSource {
                name: name.clone(),
                url: subgraph.routing_url.clone(),
                source: match &subgraph.schema {
                    Some(schema) => SchemaSource::File(config.schema_path(schema)),
                    None => SchemaSource::Introspection,
                },
            })
            .collect()
    }

    pub async fn load(&self, fetcher: &dyn SchemaFetcher) -> Result<ServiceConfig, GatewayError> {
        let schema = match &self.source {
            SchemaSource::File(path) => {
                debug!(service = %self.name, path = %path.display(), "reading schema file");
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| GatewayError::ConfigRead {
                        path: path.clone(),
                        source,
                    })?
            }
            SchemaSource::Introspection => fetcher.fetch_sdl(&self.name, &self.url).await?,
        };

        Ok(ServiceConfig {
            name: self.name.clone(),
            url: self.url.clone(),
            schema,
        })
    }
}

#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch_sdl(&self, service: &str, url: &str) -> Result<String, GatewayError>;
}

pub struct HttpSchemaFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSchemaFetcher {
    pub const SDL_QUERY: &'static str = "{ _service { sdl } }";

    pub fn new(timeout: Duration) -> Self {
        HttpSchemaFetcher {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl SchemaFetcher for HttpSchemaFetcher {
    async fn fetch_sdl(&self, service: &str, url: &str) -> Result<String, GatewayError> {
        let fetch_error = |reason: String| GatewayError::SchemaFetch {
            service: service.to_string(),
            reason,
        };

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&json!({ "query": Self::SDL_QUERY }))
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let body: Value = response.json().await.map_err(|e| fetch_error(e.to_string()))?;
        let sdl = body
            .pointer("/data/_service/sdl")
            .and_then(Value::as_str)
            .ok_or_else(|| fetch_error("response has no data._service.sdl".to_string()))?;

        info!(service, bytes = sdl.len(), "fetched subgraph schema");
        Ok(sdl.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompositionError;

    fn service(name: &str, schema: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            url: format!("http://{name}/graphql"),
            schema: schema.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_invalidates_schema() {
        let mut registry = InMemorySchemaRegistry::new();
        assert!(matches!(registry.get_schema().await, Err(GatewayError::NoSubgraphs)));

        registry
            .register_service(service("a", "type Query { a: Int }"))
            .await
            .unwrap();
        let first = registry.get_schema().await.unwrap();
        assert!(first.field("Query", "b").is_none());

        registry
            .register_service(service("b", "type Query { b: Int }"))
            .await
            .unwrap();
        let second = registry.get_schema().await.unwrap();
        assert!(second.field("Query", "b").is_some());
    }

    #[tokio::test]
    async fn test_failed_candidate_keeps_last_good_schema() {
        let mut registry = InMemorySchemaRegistry::new();
        registry
            .register_service(service("a", "type Query { a: Int }"))
            .await
            .unwrap();
        registry
            .register_service(service("b", "type Query { b: Int }"))
            .await
            .unwrap();
        let before = registry.get_schema().await.unwrap();

        let err = registry
            .replace_services(vec![service("b", "type Query { a: Int b: Int }")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Composition(CompositionError::RootFieldConflict { .. })
        ));

        let after = registry.get_schema().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(registry.services().await["b"].schema, "type Query { b: Int }");
    }

    #[tokio::test]
    async fn test_replace_swaps_on_success() {
        let mut registry = InMemorySchemaRegistry::new();
        registry
            .register_service(service("a", "type Query { a: Int }"))
            .await
            .unwrap();

        let unchanged = registry
            .replace_services(vec![service("a", "type Query { a: Int }")])
            .await
            .unwrap();
        assert!(!unchanged);

        let changed = registry
            .replace_services(vec![service("a", "type Query { a: Int c: String }")])
            .await
            .unwrap();
        assert!(changed);
        assert!(registry.get_schema().await.unwrap().field("Query", "c").is_some());
    }

    #[tokio::test]
    async fn test_sources_from_config() {
        let config = SupergraphConfig::embedded().unwrap();
        let sources = SubgraphSource::from_config(&config);

        assert_eq!(sources.len(), 4);
        assert!(sources.iter().all(|s| s.source == SchemaSource::Introspection));
        assert_eq!(sources[0].name, "community");
    }
}
