use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::identity::IdentityError;

/// Startup and registry failures of the gateway process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse deployment config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid deployment config: {0}")]
    InvalidConfig(String),

    #[error("failed to fetch schema for subgraph {service}: {reason}")]
    SchemaFetch { service: String, reason: String },

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error("no subgraphs are registered")]
    NoSubgraphs,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons the subgraph schemas cannot be merged into one supergraph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("failed to parse schema for subgraph {service}: {message}")]
    Parse { service: String, message: String },

    #[error("type {type_name} is declared as {first} in {first_service} and as {second} in {second_service}")]
    KindConflict {
        type_name: String,
        first: &'static str,
        first_service: String,
        second: &'static str,
        second_service: String,
    },

    #[error("root field {type_name}.{field} is defined by both {first} and {second}")]
    RootFieldConflict {
        type_name: String,
        field: String,
        first: String,
        second: String,
    },

    #[error("field {type_name}.{field} is owned by both {first} and {second}; mark it @external in one of them")]
    OwnershipConflict {
        type_name: String,
        field: String,
        first: String,
        second: String,
    },

    #[error("field {type_name}.{field} has type {first} in {first_service} but {second} in {second_service}")]
    FieldTypeConflict {
        type_name: String,
        field: String,
        first: String,
        first_service: String,
        second: String,
        second_service: String,
    },

    #[error("field {type_name}.{field} is @external in {service} but no subgraph provides it")]
    UnsatisfiedExternal {
        type_name: String,
        field: String,
        service: String,
    },

    #[error("field {type_name}.{field} can only be provided by subgraphs that cannot resolve {type_name} references")]
    UnresolvableEntityField { type_name: String, field: String },

    #[error("unsupported @key on {type_name} in {service}: {reason}")]
    UnsupportedKey {
        type_name: String,
        service: String,
        reason: String,
    },
}

/// Request-level rejections raised before any subgraph is contacted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Validation(String),
}

impl PlanningError {
    pub fn code(&self) -> &'static str {
        match self {
            PlanningError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            PlanningError::Validation(_) => "GRAPHQL_VALIDATION_FAILED",
        }
    }
}

/// One sub-fetch that did not produce a GraphQL response.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("subgraph {service} is unknown to the composed schema")]
    UnknownService { service: String },

    #[error("request to subgraph {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("request to subgraph {service} failed: {reason}")]
    Transport { service: String, reason: String },

    #[error("subgraph {service} answered with HTTP {status}")]
    Status { service: String, status: u16 },

    #[error("subgraph {service} returned an invalid response: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl FetchError {
    pub fn service(&self) -> &str {
        match self {
            FetchError::UnknownService { service }
            | FetchError::Timeout { service, .. }
            | FetchError::Transport { service, .. }
            | FetchError::Status { service, .. }
            | FetchError::InvalidResponse { service, .. } => service,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "SUBREQUEST_TIMEOUT",
            _ => "SUBREQUEST_HTTP_ERROR",
        }
    }
}
