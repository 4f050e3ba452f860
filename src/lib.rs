pub mod composition;
pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod identity;
pub mod query_executor;
pub mod query_planner;
pub mod response;
pub mod schema_registry;
pub mod server;
pub mod subgraph;

pub use composition::FederatedSchema;
pub use error::{CompositionError, FetchError, GatewayError, PlanningError};
pub use federation_gateway::FederationGateway;
pub use identity::{Principal, RequestIdentity, Role, TokenAuthority};
pub use query_executor::{HttpQueryExecutor, HttpSubgraphClient};
pub use query_planner::{QueryPlan, SimpleQueryPlanner};
pub use response::{GraphQLError, GraphQLResponse};
pub use schema_registry::InMemorySchemaRegistry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type ServiceMap = BTreeMap<String, ServiceConfig>;

/// A subgraph as known to the gateway: where it lives and the SDL it
/// published the last time it was asked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    pub schema: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub identity: RequestIdentity,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_identity(mut self, identity: RequestIdentity) -> Self {
        self.identity = identity;
        self
    }
}
