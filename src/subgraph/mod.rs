//! The four subgraph services.
//!
//! Each one is an `async-graphql` federation schema over its own
//! [`store::DocumentStore`], served by the same HTTP loop as the gateway.
//! Entities owned elsewhere are returned as bare `{__typename, id}` stubs
//! for the gateway to resolve.

pub mod community;
pub mod guard;
pub mod nurse;
pub mod patient;
pub mod provisioning;
pub mod store;
pub mod users;

use async_graphql::{Executor, ID, SDLExportOptions, SimpleObject};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use serde_json::{Value, json};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::debug;

use crate::config::SupergraphConfig;
use crate::identity::{RequestIdentity, TokenAuthority};
use crate::server::{CorsPolicy, GraphQLEndpoint, serve};
use provisioning::HttpProvisioner;
use store::InMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SubgraphKind {
    Users,
    Patient,
    Nurse,
    Community,
}

impl SubgraphKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubgraphKind::Users => "users",
            SubgraphKind::Patient => "patient",
            SubgraphKind::Nurse => "nurse",
            SubgraphKind::Community => "community",
        }
    }
}

/// A `User` owned by the users subgraph, carried as its key only.
#[derive(SimpleObject, Clone, Debug, PartialEq)]
#[graphql(name = "User", unresolvable)]
pub struct UserRef {
    pub id: ID,
}

impl UserRef {
    pub fn new(id: &ID) -> Self {
        UserRef { id: id.clone() }
    }
}

/// Adapts an `async-graphql` schema to the shared HTTP front. The asserted
/// identity is attached to the request as context data.
pub struct SubgraphEndpoint<S> {
    name: &'static str,
    executor: S,
}

impl<S: Executor> SubgraphEndpoint<S> {
    pub fn new(name: &'static str, executor: S) -> Self {
        SubgraphEndpoint { name, executor }
    }
}

#[async_trait]
impl<S: Executor> GraphQLEndpoint for SubgraphEndpoint<S> {
    async fn execute(&self, body: Bytes, identity: RequestIdentity) -> (StatusCode, Value) {
        let request = match serde_json::from_slice::<async_graphql::Request>(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    json!({"errors": [{"message": format!("Invalid JSON request: {e}")}]}),
                );
            }
        };

        debug!(
            service = self.name,
            principal = identity.principal.as_ref().map(|p| p.id.as_str()),
            "executing subgraph request"
        );
        let response = self.executor.execute(request.data(identity)).await;
        (
            StatusCode::OK,
            serde_json::to_value(&response).unwrap_or_default(),
        )
    }
}

/// The federation SDL a schema publishes through `_service { sdl }`.
pub fn federation_sdl<Q, M>(schema: &async_graphql::Schema<Q, M, async_graphql::EmptySubscription>) -> String
where
    Q: async_graphql::ObjectType + 'static,
    M: async_graphql::ObjectType + 'static,
{
    schema.sdl_with_options(SDLExportOptions::new().federation())
}

/// Builds `kind` with empty stores and serves it until `shutdown` resolves.
pub async fn serve_subgraph<F>(
    kind: SubgraphKind,
    listener: TcpListener,
    config: &SupergraphConfig,
    authority: TokenAuthority,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    let cors = CorsPolicy::default();
    let name = kind.as_str();
    match kind {
        SubgraphKind::Users => {
            let provisioner = HttpProvisioner::new(
                authority.clone(),
                config.provisioning.clone(),
                config.identity.provisioning_token_ttl(),
            );
            let schema = users::build_schema(
                Arc::new(InMemoryStore::<users::User>::new()),
                authority.clone(),
                Arc::new(provisioner),
            );
            serve(listener, Arc::new(SubgraphEndpoint::new(name, schema)), authority, cors, shutdown).await
        }
        SubgraphKind::Patient => {
            let schema = patient::build_schema(Arc::new(InMemoryStore::<patient::PatientData>::new()));
            serve(listener, Arc::new(SubgraphEndpoint::new(name, schema)), authority, cors, shutdown).await
        }
        SubgraphKind::Nurse => {
            let schema = nurse::build_schema(Arc::new(InMemoryStore::<nurse::Nurse>::new()));
            serve(listener, Arc::new(SubgraphEndpoint::new(name, schema)), authority, cors, shutdown).await
        }
        SubgraphKind::Community => {
            let schema = community::build_schema(
                Arc::new(InMemoryStore::<community::Post>::new()),
                Arc::new(InMemoryStore::<community::HelpRequest>::new()),
            );
            serve(listener, Arc::new(SubgraphEndpoint::new(name, schema)), authority, cors, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::compose;
    use crate::subgraph::provisioning::{NewAccount, Provisioner, ProvisioningError};
    use crate::{ServiceConfig, ServiceMap};
    use std::time::Duration;

    struct NoProvisioning;

    #[async_trait]
    impl Provisioner for NoProvisioning {
        async fn provision(&self, _account: &NewAccount) -> Result<(), ProvisioningError> {
            Ok(())
        }
    }

    fn services(sdl: [(&str, String); 4]) -> ServiceMap {
        sdl.into_iter()
            .map(|(name, schema)| {
                (
                    name.to_string(),
                    ServiceConfig {
                        name: name.to_string(),
                        url: format!("http://{name}/graphql"),
                        schema,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_runtime_sdl_matches_checked_in_schemas() {
        let authority = TokenAuthority::with_secret("secret", Duration::from_secs(60)).unwrap();
        let runtime = compose(&services([
            (
                "users",
                federation_sdl(&users::build_schema(
                    Arc::new(InMemoryStore::<users::User>::new()),
                    authority,
                    Arc::new(NoProvisioning),
                )),
            ),
            (
                "patient",
                federation_sdl(&patient::build_schema(Arc::new(
                    InMemoryStore::<patient::PatientData>::new(),
                ))),
            ),
            (
                "nurse",
                federation_sdl(&nurse::build_schema(Arc::new(InMemoryStore::<nurse::Nurse>::new()))),
            ),
            (
                "community",
                federation_sdl(&community::build_schema(
                    Arc::new(InMemoryStore::<community::Post>::new()),
                    Arc::new(InMemoryStore::<community::HelpRequest>::new()),
                )),
            ),
        ]))
        .unwrap();

        let checked_in = compose(&services([
            ("users", include_str!("../../schemas/users.graphql").to_string()),
            ("patient", include_str!("../../schemas/patient.graphql").to_string()),
            ("nurse", include_str!("../../schemas/nurse.graphql").to_string()),
            ("community", include_str!("../../schemas/community.graphql").to_string()),
        ]))
        .unwrap();

        for (type_name, expected) in &checked_in.types {
            let actual = runtime
                .get_type(type_name)
                .unwrap_or_else(|| panic!("runtime schema has no type {type_name}"));
            assert_eq!(actual.kind, expected.kind, "kind of {type_name}");
            for (field_name, field) in &expected.fields {
                let runtime_field = actual
                    .fields
                    .get(field_name)
                    .unwrap_or_else(|| panic!("runtime schema has no field {type_name}.{field_name}"));
                assert_eq!(
                    runtime_field.ty.to_string(),
                    field.ty.to_string(),
                    "type of {type_name}.{field_name}"
                );
            }
        }
        for (entity, field) in [
            ("User", "userName"),
            ("PatientData", "symptoms"),
            ("Nurse", "specialization"),
            ("Post", "title"),
            ("HelpRequest", "description"),
        ] {
            assert_eq!(
                runtime.entity_service_for(entity, field),
                checked_in.entity_service_for(entity, field),
                "owner of {entity}"
            );
        }
    }
}
