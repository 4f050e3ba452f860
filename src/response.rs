//! GraphQL response envelope and the final shaping pass over merged data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::composition::TypeRef;
use crate::error::{FetchError, PlanningError};
use crate::query_planner::FieldSelection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    Key(String),
    Index(usize),
}

impl From<&str> for PathElement {
    fn from(key: &str) -> Self {
        PathElement::Key(key.to_string())
    }
}

impl From<usize> for PathElement {
    fn from(index: usize) -> Self {
        PathElement::Index(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathElement>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: Map::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<PathElement>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_code(self, code: &str) -> Self {
        self.with_extension("code", Value::String(code.to_string()))
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions.insert(key.to_string(), value);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions.get("code").and_then(Value::as_str)
    }

    /// A sub-fetch failure attached to the response position it left empty.
    pub fn from_fetch(error: &FetchError, path: Vec<PathElement>) -> Self {
        GraphQLError::new(error.to_string())
            .with_path(path)
            .with_code(error.code())
            .with_extension("serviceName", Value::String(error.service().to_string()))
    }

    /// True when this error already accounts for a null at `path`.
    fn covers(&self, path: &[PathElement]) -> bool {
        match &self.path {
            Some(own) => own.starts_with(path) || path.starts_with(own),
            None => false,
        }
    }
}

impl From<PlanningError> for GraphQLError {
    fn from(error: PlanningError) -> Self {
        let code = error.code();
        GraphQLError::new(error.to_string()).with_code(code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// A request-level failure: no data, one error.
    pub fn from_error(error: impl Into<GraphQLError>) -> Self {
        GraphQLResponse {
            data: None,
            errors: vec![error.into()],
        }
    }

    /// Request-level failures are the ones that never produced data.
    pub fn is_request_error(&self) -> bool {
        self.data.is_none() && !self.errors.is_empty()
    }
}

/// Signals that a non-null position resolved to null and the enclosing
/// nullable position has to absorb it.
struct NullBubble;

/// Reduces the merged subgraph results to exactly what the client selected,
/// filling `__typename` and applying non-null propagation. Returns the value
/// of the `data` key (`null` when a non-null root field was lost).
pub fn complete_data(
    data: Value,
    selections: &[FieldSelection],
    root_type: &str,
    errors: &mut Vec<GraphQLError>,
) -> Value {
    let mut path = Vec::new();
    match complete_object(&data, selections, root_type, &mut path, errors) {
        Ok(object) => Value::Object(object),
        Err(NullBubble) => Value::Null,
    }
}

fn complete_object(
    value: &Value,
    selections: &[FieldSelection],
    type_name: &str,
    path: &mut Vec<PathElement>,
    errors: &mut Vec<GraphQLError>,
) -> Result<Map<String, Value>, NullBubble> {
    let empty = Map::new();
    let object = value.as_object().unwrap_or(&empty);
    let mut completed = Map::new();

    for selection in selections {
        if selection.name == "__typename" {
            let typename = object
                .get("__typename")
                .cloned()
                .unwrap_or_else(|| Value::String(type_name.to_string()));
            completed.insert(selection.response_key.clone(), typename);
            continue;
        }

        let raw = object.get(&selection.response_key).unwrap_or(&Value::Null);
        path.push(PathElement::Key(selection.response_key.clone()));
        let result = complete_value(raw, &selection.field_type, selection, path, errors);
        path.pop();
        completed.insert(selection.response_key.clone(), result?);
    }

    Ok(completed)
}

fn complete_value(
    value: &Value,
    ty: &TypeRef,
    selection: &FieldSelection,
    path: &mut Vec<PathElement>,
    errors: &mut Vec<GraphQLError>,
) -> Result<Value, NullBubble> {
    match ty {
        TypeRef::NonNull(inner) => match complete_nullable(value, inner, selection, path, errors) {
            Ok(Value::Null) => {
                if !errors.iter().any(|e| e.covers(path)) {
                    errors.push(
                        GraphQLError::new(format!(
                            "Cannot return null for non-nullable field {}.{}.",
                            selection.parent_type, selection.name
                        ))
                        .with_path(path.clone()),
                    );
                }
                Err(NullBubble)
            }
            other => other,
        },
        _ => Ok(complete_nullable(value, ty, selection, path, errors).unwrap_or(Value::Null)),
    }
}

fn complete_nullable(
    value: &Value,
    ty: &TypeRef,
    selection: &FieldSelection,
    path: &mut Vec<PathElement>,
    errors: &mut Vec<GraphQLError>,
) -> Result<Value, NullBubble> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match ty {
        TypeRef::List(inner) => {
            let Value::Array(items) = value else {
                errors.push(
                    GraphQLError::new(format!(
                        "Expected a list for field {}.{}.",
                        selection.parent_type, selection.name
                    ))
                    .with_path(path.clone()),
                );
                return Ok(Value::Null);
            };
            let mut completed = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                path.push(PathElement::Index(index));
                let result = complete_value(item, inner, selection, path, errors);
                path.pop();
                completed.push(result?);
            }
            Ok(Value::Array(completed))
        }
        TypeRef::NonNull(inner) => complete_value(value, inner, selection, path, errors),
        TypeRef::Named(name) => {
            if selection.selections.is_empty() {
                Ok(value.clone())
            } else {
                complete_object(value, &selection.selections, name, path, errors).map(Value::Object)
            }
        }
    }
}
