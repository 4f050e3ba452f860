use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::SupergraphConfig;
use crate::error::GatewayError;
use crate::query_executor::{HttpQueryExecutor, QueryExecutor};
use crate::query_planner::{QueryPlanner, SimpleQueryPlanner};
use crate::response::{GraphQLError, GraphQLResponse};
use crate::schema_registry::{
    HttpSchemaFetcher, InMemorySchemaRegistry, SchemaFetcher, SchemaRegistry, SubgraphSource,
};
use crate::{GraphQLRequest, ServiceConfig};

pub struct FederationGateway {
    schema_registry: Arc<RwLock<Box<dyn SchemaRegistry + Send + Sync>>>,
    query_planner: Arc<Box<dyn QueryPlanner + Send + Sync>>,
    query_executor: Arc<Box<dyn QueryExecutor + Send + Sync>>,
    schema_fetcher: Arc<dyn SchemaFetcher>,
    sources: RwLock<Vec<SubgraphSource>>,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Box<dyn SchemaRegistry + Send + Sync>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
        schema_fetcher: Arc<dyn SchemaFetcher>,
    ) -> Self {
        FederationGateway {
            schema_registry: Arc::new(RwLock::new(schema_registry)),
            query_planner: Arc::new(query_planner),
            query_executor: Arc::new(query_executor),
            schema_fetcher,
            sources: RwLock::new(Vec::new()),
        }
    }

    /// The HTTP-backed gateway with every outbound call bounded by the
    /// configured subgraph timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        FederationGateway::new(
            Box::new(InMemorySchemaRegistry::new()),
            Box::new(SimpleQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new(timeout)),
            Arc::new(HttpSchemaFetcher::new(timeout)),
        )
    }

    pub async fn process_request(&self, request: GraphQLRequest) -> GraphQLResponse {
        debug!(
            operation = request.operation_name.as_deref().unwrap_or("<anonymous>"),
            authenticated = request.identity.is_authenticated(),
            "processing request"
        );

        let schema_registry = self.schema_registry.read().await;
        let schema = schema_registry.get_schema().await;
        drop(schema_registry);
        let schema = match schema {
            Ok(schema) => schema,
            Err(e) => {
                error!(error = %e, "no composed schema available");
                return GraphQLResponse::from_error(
                    GraphQLError::new(e.to_string()).with_code("INTERNAL_SERVER_ERROR"),
                );
            }
        };

        let query_plan = match self.query_planner.plan_query(&request, &schema).await {
            Ok(plan) => plan,
            Err(e) => {
                debug!(error = %e, "request rejected before execution");
                return GraphQLResponse::from_error(e);
            }
        };

        self.query_executor
            .execute_plan(&query_plan, &schema, &request.identity)
            .await
    }

    pub async fn register_service(&self, service: ServiceConfig) -> Result<(), GatewayError> {
        let mut schema_registry = self.schema_registry.write().await;
        schema_registry.register_service(service).await
    }

    /// Loads every subgraph's SDL and composes the supergraph. Any subgraph
    /// that cannot be reached, or any composition error, aborts startup.
    pub async fn load_schemas(&self, config: &SupergraphConfig) -> Result<(), GatewayError> {
        let sources = SubgraphSource::from_config(config);
        let services = self.fetch_all(&sources).await?;

        for service in services {
            self.register_service(service).await?;
        }
        *self.sources.write().await = sources;

        let schema = self.schema_registry.read().await.get_schema().await?;
        info!(
            subgraphs = schema.services.len(),
            types = schema.types.len(),
            "supergraph composed"
        );
        Ok(())
    }

    /// Re-reads every subgraph's SDL and recomposes if something changed. A
    /// candidate that fails to compose is rejected and the running schema
    /// stays in place.
    pub async fn refresh(&self) -> Result<bool, GatewayError> {
        let sources = self.sources.read().await.clone();
        let services = self.fetch_all(&sources).await?;

        let mut schema_registry = self.schema_registry.write().await;
        let changed = schema_registry.replace_services(services).await?;
        if changed {
            info!("subgraph schemas changed; supergraph recomposed");
        }
        Ok(changed)
    }

    pub fn spawn_schema_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately and startup has just composed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = gateway.refresh().await {
                    error!(error = %e, "schema refresh failed; keeping the last good supergraph");
                }
            }
        })
    }

    async fn fetch_all(&self, sources: &[SubgraphSource]) -> Result<Vec<ServiceConfig>, GatewayError> {
        let fetcher = self.schema_fetcher.as_ref();
        try_join_all(sources.iter().map(|source| source.load(fetcher))).await
    }
}
