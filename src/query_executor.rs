use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::composition::FederatedSchema;
use crate::error::FetchError;
use crate::identity::RequestIdentity;
use crate::query_planner::{FetchKind, FetchNode, FieldSelection, OperationKind, PathSegment, QueryPlan};
use crate::response::{self, GraphQLError, GraphQLResponse, PathElement};
use crate::ServiceConfig;

#[async_trait]
pub trait QueryExecutor {
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &FederatedSchema,
        identity: &RequestIdentity,
    ) -> GraphQLResponse;
}

/// Transport for one sub-fetch.
#[async_trait]
pub trait SubgraphClient: Send + Sync {
    async fn send(
        &self,
        service: &ServiceConfig,
        body: &Value,
        token: Option<&str>,
    ) -> Result<GraphQLResponse, FetchError>;
}

pub struct HttpSubgraphClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSubgraphClient {
    pub fn new(timeout: Duration) -> Self {
        HttpSubgraphClient {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// The caller's token is forwarded untouched; without one no
    /// `Authorization` header is sent at all.
    pub fn build_request(&self, url: &str, body: &Value, token: Option<&str>) -> reqwest::RequestBuilder {
        let request = self.client.post(url).timeout(self.timeout).json(body);
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, service: &str, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout {
                service: service.to_string(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Transport {
                service: service.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl SubgraphClient for HttpSubgraphClient {
    async fn send(
        &self,
        service: &ServiceConfig,
        body: &Value,
        token: Option<&str>,
    ) -> Result<GraphQLResponse, FetchError> {
        let response = self
            .build_request(&service.url, body, token)
            .send()
            .await
            .map_err(|e| self.transport_error(&service.name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                service: service.name.clone(),
                status: status.as_u16(),
            });
        }

        response.json::<GraphQLResponse>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(&service.name, e)
            } else {
                FetchError::InvalidResponse {
                    service: service.name.clone(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

pub struct HttpQueryExecutor {
    client: Arc<dyn SubgraphClient>,
}

impl HttpQueryExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(Arc::new(HttpSubgraphClient::new(timeout)))
    }

    pub fn with_client(client: Arc<dyn SubgraphClient>) -> Self {
        HttpQueryExecutor { client }
    }

    async fn fetch(
        &self,
        schema: &FederatedSchema,
        node: &FetchNode,
        representations: Option<&[Value]>,
        token: Option<&str>,
    ) -> Result<GraphQLResponse, FetchError> {
        let service = schema
            .services
            .get(&node.service)
            .ok_or_else(|| FetchError::UnknownService {
                service: node.service.clone(),
            })?;

        let body = match representations {
            Some(representations) => json!({
                "query": node.operation,
                "variables": { "representations": representations },
            }),
            None => json!({ "query": node.operation }),
        };

        debug!(service = %node.service, operation = %node.operation, "sending sub-fetch");
        let result = self.client.send(service, &body, token).await;
        if let Err(e) = &result {
            warn!(service = %node.service, error = %e, "sub-fetch failed");
        }
        result
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &FederatedSchema,
        identity: &RequestIdentity,
    ) -> GraphQLResponse {
        let token = identity.token.as_deref();
        let mut data = Value::Object(Map::new());
        let mut errors = Vec::new();

        let results = match plan.kind {
            OperationKind::Query => {
                join_all(plan.fetches.iter().map(|node| self.fetch(schema, node, None, token))).await
            }
            OperationKind::Mutation => {
                let mut results = Vec::with_capacity(plan.fetches.len());
                for node in &plan.fetches {
                    results.push(self.fetch(schema, node, None, token).await);
                }
                results
            }
        };
        for (node, result) in plan.fetches.iter().zip(results) {
            merge_root(node, result, &mut data, &mut errors);
        }

        // Entity fetches run level by level: every fetch on a level only
        // depends on data merged by the levels above it.
        let mut level: Vec<&FetchNode> = plan.fetches.iter().flat_map(|node| &node.dependents).collect();
        while !level.is_empty() {
            let batches: Vec<(&FetchNode, EntityBatch)> = level
                .iter()
                .filter_map(|node| EntityBatch::collect(node, &data).map(|batch| (*node, batch)))
                .collect();

            let results = join_all(batches.iter().map(|(node, batch)| {
                self.fetch(schema, node, Some(batch.representations.as_slice()), token)
            }))
            .await;

            let mut next = Vec::new();
            for ((node, batch), result) in batches.into_iter().zip(results) {
                batch.merge(node, result, &mut data, &mut errors);
                next.extend(&node.dependents);
            }
            level = next;
        }

        let data = response::complete_data(data, &plan.shape, plan.root_type(), &mut errors);
        GraphQLResponse {
            data: Some(data),
            errors,
        }
    }
}

fn merge_root(
    node: &FetchNode,
    result: Result<GraphQLResponse, FetchError>,
    data: &mut Value,
    errors: &mut Vec<GraphQLError>,
) {
    match result {
        Ok(response) => {
            if let (Some(Value::Object(fields)), Value::Object(root)) = (response.data, &mut *data) {
                root.extend(fields);
            }
            errors.extend(
                response
                    .errors
                    .into_iter()
                    .map(|error| tag_service(error, &node.service)),
            );
        }
        Err(e) => {
            for selection in &node.selections {
                errors.push(GraphQLError::from_fetch(
                    &e,
                    vec![PathElement::Key(selection.response_key.clone())],
                ));
            }
        }
    }
}

fn tag_service(mut error: GraphQLError, service: &str) -> GraphQLError {
    error
        .extensions
        .entry("serviceName")
        .or_insert_with(|| Value::String(service.to_string()));
    error
}

/// What the gateway finds at an entity position before asking the owning
/// subgraph about it.
#[derive(Debug, Clone, PartialEq)]
enum EntitySlot {
    /// Already carries every field the entity fetch would add.
    Resolved,
    /// `{__typename, key...}` awaiting hydration.
    Reference(Value),
    /// The object lacks its key fields and cannot be resolved further.
    Unkeyed,
}

impl EntitySlot {
    fn classify(
        object: &Map<String, Value>,
        type_name: &str,
        key_fields: &[String],
        requested: &[FieldSelection],
    ) -> Self {
        let mut wanted = requested
            .iter()
            .filter(|s| s.name != "__typename" && !key_fields.contains(&s.response_key))
            .peekable();
        if wanted.peek().is_some() && wanted.all(|s| object.contains_key(&s.response_key)) {
            return EntitySlot::Resolved;
        }

        let mut representation = Map::new();
        representation.insert("__typename".to_string(), Value::String(type_name.to_string()));
        for key in key_fields {
            match object.get(key) {
                Some(value) if !value.is_null() => {
                    representation.insert(key.clone(), value.clone());
                }
                _ => return EntitySlot::Unkeyed,
            }
        }
        EntitySlot::Reference(Value::Object(representation))
    }
}

/// The positions an entity fetch fills and the deduplicated
/// representations sent for them.
#[derive(Debug)]
struct EntityBatch {
    /// Response path of each target and the representation it maps to.
    targets: Vec<(Vec<PathElement>, usize)>,
    representations: Vec<Value>,
}

impl EntityBatch {
    fn collect(node: &FetchNode, data: &Value) -> Option<Self> {
        let FetchKind::Entities { type_name, key_fields } = &node.kind else {
            return None;
        };

        let mut found = Vec::new();
        collect_objects(data, &node.path, &mut Vec::new(), &mut found);

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut batch = EntityBatch {
            targets: Vec::new(),
            representations: Vec::new(),
        };
        for (path, object) in found {
            let representation = match EntitySlot::classify(object, type_name, key_fields, &node.selections) {
                EntitySlot::Reference(representation) => representation,
                EntitySlot::Resolved | EntitySlot::Unkeyed => continue,
            };
            let index = *seen.entry(representation.to_string()).or_insert_with(|| {
                batch.representations.push(representation);
                batch.representations.len() - 1
            });
            batch.targets.push((path, index));
        }

        (!batch.targets.is_empty()).then_some(batch)
    }

    fn merge(
        &self,
        node: &FetchNode,
        result: Result<GraphQLResponse, FetchError>,
        data: &mut Value,
        errors: &mut Vec<GraphQLError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                for (path, _) in &self.targets {
                    errors.push(GraphQLError::from_fetch(&e, path.clone()));
                }
                return;
            }
        };

        for error in response.errors {
            let error = tag_service(error, &node.service);
            match entity_index(&error) {
                Some((index, rest)) => {
                    for (path, _) in self.targets.iter().filter(|(_, i)| *i == index) {
                        let mut remapped = error.clone();
                        let mut full = path.clone();
                        full.extend_from_slice(&rest);
                        remapped.path = Some(full);
                        errors.push(remapped);
                    }
                }
                None => errors.push(GraphQLError { path: None, ..error }),
            }
        }

        let Some(Value::Array(entities)) = response.data.and_then(|mut d| d.get_mut("_entities").map(Value::take)) else {
            return;
        };
        for (path, index) in &self.targets {
            let Some(slot) = value_at_mut(data, path) else {
                continue;
            };
            match entities.get(*index) {
                Some(entity @ Value::Object(_)) => deep_merge(slot, entity.clone()),
                _ => *slot = Value::Null,
            }
        }
    }
}

/// Splits an `_entities.<i>.rest` error path into `i` and `rest`.
fn entity_index(error: &GraphQLError) -> Option<(usize, Vec<PathElement>)> {
    match error.path.as_deref()? {
        [PathElement::Key(root), PathElement::Index(index), rest @ ..] if root == "_entities" => {
            Some((*index, rest.to_vec()))
        }
        _ => None,
    }
}

fn collect_objects<'v>(
    value: &'v Value,
    path: &[PathSegment],
    current: &mut Vec<PathElement>,
    out: &mut Vec<(Vec<PathElement>, &'v Map<String, Value>)>,
) {
    match path.split_first() {
        None => {
            if let Value::Object(object) = value {
                out.push((current.clone(), object));
            }
        }
        Some((PathSegment::Key(key), rest)) => {
            if let Some(child) = value.get(key) {
                current.push(PathElement::Key(key.clone()));
                collect_objects(child, rest, current, out);
                current.pop();
            }
        }
        Some((PathSegment::Flatten, rest)) => {
            if let Value::Array(items) = value {
                for (index, item) in items.iter().enumerate() {
                    current.push(PathElement::Index(index));
                    collect_objects(item, rest, current, out);
                    current.pop();
                }
            }
        }
    }
}

fn value_at_mut<'v>(value: &'v mut Value, path: &[PathElement]) -> Option<&'v mut Value> {
    path.iter().try_fold(value, |current, element| match element {
        PathElement::Key(key) => current.as_object_mut()?.get_mut(key),
        PathElement::Index(index) => current.as_array_mut()?.get_mut(*index),
    })
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (existing, value) in target.iter_mut().zip(source) {
                deep_merge(existing, value);
            }
        }
        (target, source) => *target = source,
    }
}
