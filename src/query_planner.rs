use async_trait::async_trait;
use graphql_parser::query::{
    Definition, Directive, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    TypeCondition, Value as AstValue, VariableDefinition, parse_query,
};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::GraphQLRequest;
use crate::composition::{FederatedSchema, ROOT_TYPES, TypeKind, TypeRef};
use crate::error::PlanningError;

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &FederatedSchema,
    ) -> Result<QueryPlan, PlanningError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }

    pub fn root_type(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        }
    }
}

/// One field of the client's operation after fragments, directives and
/// variables have been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSelection {
    pub response_key: String,
    pub name: String,
    pub alias: Option<String>,
    /// Argument values rendered as GraphQL literals, variables inlined.
    pub arguments: Vec<(String, String)>,
    pub parent_type: String,
    pub field_type: TypeRef,
    pub selections: Vec<FieldSelection>,
}

impl FieldSelection {
    pub(crate) fn typename(parent_type: &str) -> Self {
        FieldSelection {
            response_key: "__typename".to_string(),
            name: "__typename".to_string(),
            alias: None,
            arguments: Vec::new(),
            parent_type: parent_type.to_string(),
            field_type: TypeRef::non_null(TypeRef::named("String")),
            selections: Vec::new(),
        }
    }
}

/// A step from the response root towards the objects an entity fetch
/// resolves. `Flatten` descends into every element of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Flatten,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchKind {
    Root,
    Entities {
        type_name: String,
        key_fields: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchNode {
    pub service: String,
    pub kind: FetchKind,
    /// The document sent to the subgraph.
    pub operation: String,
    /// Fields requested from the subgraph, including injected keys.
    pub selections: Vec<FieldSelection>,
    /// Where the results are merged. Empty for root fetches.
    pub path: Vec<PathSegment>,
    /// Entity fetches that need this fetch's results first.
    pub dependents: Vec<FetchNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub kind: OperationKind,
    /// Root fetches: concurrent for queries, in order for mutations.
    pub fetches: Vec<FetchNode>,
    /// The client's selection set, used to shape the merged result.
    pub shape: Vec<FieldSelection>,
}

impl QueryPlan {
    pub fn root_type(&self) -> &'static str {
        self.kind.root_type()
    }
}

pub struct SimpleQueryPlanner;

impl SimpleQueryPlanner {
    pub fn new() -> Self {
        SimpleQueryPlanner
    }

    /// Synchronous core of [`QueryPlanner::plan_query`].
    pub fn plan(
        &self,
        request: &GraphQLRequest,
        schema: &FederatedSchema,
    ) -> Result<QueryPlan, PlanningError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| PlanningError::Parse(format!("Syntax error: {}", e.to_string().trim())))?;

        let mut operations = Vec::new();
        let mut fragments = HashMap::new();
        for definition in &document.definitions {
            match definition {
                Definition::Operation(operation) => operations.push(operation),
                Definition::Fragment(fragment) => {
                    if fragments.insert(fragment.name.clone(), fragment).is_some() {
                        return Err(validation(format!(
                            "There can be only one fragment named \"{}\".",
                            fragment.name
                        )));
                    }
                }
            }
        }

        let operation = select_operation(&operations, request.operation_name.as_deref())?;
        let (kind, variable_definitions, selection_set) = match operation {
            OperationDefinition::SelectionSet(set) => (OperationKind::Query, &[][..], set),
            OperationDefinition::Query(query) => (
                OperationKind::Query,
                &query.variable_definitions[..],
                &query.selection_set,
            ),
            OperationDefinition::Mutation(mutation) => (
                OperationKind::Mutation,
                &mutation.variable_definitions[..],
                &mutation.selection_set,
            ),
            OperationDefinition::Subscription(_) => {
                return Err(validation("Subscriptions are not supported by this gateway."));
            }
        };

        if schema.get_type(kind.root_type()).is_none() {
            return Err(validation(format!(
                "Schema is not configured for {} operations.",
                kind.as_str()
            )));
        }

        let (variables, absent) =
            coerce_variables(schema, variable_definitions, request.variables.as_ref())?;
        let normalizer = Normalizer {
            schema,
            fragments: &fragments,
            variables: &variables,
            absent: &absent,
        };
        let mut shape = Vec::new();
        normalizer.collect_fields(kind.root_type(), selection_set, &mut Vec::new(), &mut shape)?;

        let mut builder = PlanBuilder {
            schema,
            kind,
            counter: 0,
        };
        let fetches = builder.root_fetches(&shape)?;

        Ok(QueryPlan {
            kind,
            fetches,
            shape,
        })
    }
}

impl Default for SimpleQueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryPlanner for SimpleQueryPlanner {
    async fn plan_query(
        &self,
        request: &GraphQLRequest,
        schema: &FederatedSchema,
    ) -> Result<QueryPlan, PlanningError> {
        self.plan(request, schema)
    }
}

fn validation(message: impl Into<String>) -> PlanningError {
    PlanningError::Validation(message.into())
}

fn select_operation<'d, 'a>(
    operations: &[&'d OperationDefinition<'a, String>],
    name: Option<&str>,
) -> Result<&'d OperationDefinition<'a, String>, PlanningError> {
    let operation_name = |op: &OperationDefinition<'a, String>| -> Option<String> {
        match op {
            OperationDefinition::SelectionSet(_) => None,
            OperationDefinition::Query(q) => q.name.clone(),
            OperationDefinition::Mutation(m) => m.name.clone(),
            OperationDefinition::Subscription(s) => s.name.clone(),
        }
    };

    match name {
        Some(wanted) => operations
            .iter()
            .copied()
            .find(|op| operation_name(op).as_deref() == Some(wanted))
            .ok_or_else(|| validation(format!("Unknown operation named \"{wanted}\"."))),
        None => match operations {
            [] => Err(validation("The document does not contain an operation.")),
            [only] => Ok(*only),
            _ => Err(validation(
                "Must provide operation name if query contains multiple operations.",
            )),
        },
    }
}

/// Coerced variable values, plus the nullable variables that were neither
/// supplied nor defaulted.
fn coerce_variables<'a>(
    schema: &FederatedSchema,
    definitions: &[VariableDefinition<'a, String>],
    provided: Option<&Value>,
) -> Result<(Map<String, Value>, BTreeSet<String>), PlanningError> {
    let provided = match provided {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => return Err(validation("Variables must be provided as a JSON object.")),
    };

    let mut coerced = Map::new();
    let mut absent = BTreeSet::new();
    for definition in definitions {
        let ty = TypeRef::from_ast(&definition.var_type);
        if !schema.is_input(ty.type_name()) {
            return Err(validation(format!(
                "Variable \"${}\" cannot be non-input type \"{}\".",
                definition.name, ty
            )));
        }

        let value = match provided.and_then(|map| map.get(&definition.name)) {
            Some(value) => Some(value.clone()),
            None => match &definition.default_value {
                Some(default) => Some(ast_to_json(default, &Map::new())?),
                None => None,
            },
        };

        match value {
            Some(Value::Null) | None if ty.is_non_null() => {
                return Err(validation(format!(
                    "Variable \"${}\" of required type \"{}\" was not provided.",
                    definition.name, ty
                )));
            }
            Some(value) => {
                coerced.insert(definition.name.clone(), value);
            }
            None => {
                coerced.insert(definition.name.clone(), Value::Null);
                absent.insert(definition.name.clone());
            }
        }
    }
    Ok((coerced, absent))
}

fn ast_to_json<'a>(value: &AstValue<'a, String>, variables: &Map<String, Value>) -> Result<Value, PlanningError> {
    Ok(match value {
        AstValue::Variable(name) => variables
            .get(name)
            .cloned()
            .ok_or_else(|| validation(format!("Variable \"${name}\" is not defined.")))?,
        AstValue::Int(number) => number
            .as_i64()
            .map(Value::from)
            .ok_or_else(|| validation("Int literal is out of range."))?,
        AstValue::Float(float) => Number::from_f64(*float)
            .map(Value::Number)
            .ok_or_else(|| validation("Float literal is not finite."))?,
        AstValue::String(string) => Value::String(string.clone()),
        AstValue::Boolean(flag) => Value::Bool(*flag),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => Value::String(name.clone()),
        AstValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| ast_to_json(item, variables))
                .collect::<Result<_, _>>()?,
        ),
        AstValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), ast_to_json(item, variables)?)))
                .collect::<Result<_, PlanningError>>()?,
        ),
    })
}

struct Normalizer<'p, 'd, 'a> {
    schema: &'p FederatedSchema,
    fragments: &'p HashMap<String, &'d FragmentDefinition<'a, String>>,
    variables: &'p Map<String, Value>,
    absent: &'p BTreeSet<String>,
}

impl<'p, 'd, 'a> Normalizer<'p, 'd, 'a> {
    fn collect_fields(
        &self,
        parent: &str,
        set: &SelectionSet<'a, String>,
        visiting: &mut Vec<String>,
        out: &mut Vec<FieldSelection>,
    ) -> Result<(), PlanningError> {
        for item in &set.items {
            match item {
                Selection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    let selection = self.field_selection(parent, field, visiting)?;
                    merge_selection(out, selection)?;
                }
                Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let fragment = self.fragments.get(&spread.fragment_name).ok_or_else(|| {
                        validation(format!("Unknown fragment \"{}\".", spread.fragment_name))
                    })?;
                    if visiting.contains(&spread.fragment_name) {
                        return Err(validation(format!(
                            "Cannot spread fragment \"{}\" within itself.",
                            spread.fragment_name
                        )));
                    }
                    self.check_type_condition(parent, &fragment.type_condition)?;
                    visiting.push(spread.fragment_name.clone());
                    self.collect_fields(parent, &fragment.selection_set, visiting, out)?;
                    visiting.pop();
                }
                Selection::InlineFragment(inline) => {
                    if !self.included(&inline.directives)? {
                        continue;
                    }
                    if let Some(condition) = &inline.type_condition {
                        self.check_type_condition(parent, condition)?;
                    }
                    self.collect_fields(parent, &inline.selection_set, visiting, out)?;
                }
            }
        }
        Ok(())
    }

    fn check_type_condition(
        &self,
        parent: &str,
        condition: &TypeCondition<'a, String>,
    ) -> Result<(), PlanningError> {
        let TypeCondition::On(type_name) = condition;
        if type_name == parent {
            return Ok(());
        }
        let Some(target) = self.schema.get_type(type_name) else {
            return Err(validation(format!("Unknown type \"{type_name}\".")));
        };
        let parent_kind = self.schema.get_type(parent).map(|t| t.kind);
        if target.kind != TypeKind::Object || parent_kind != Some(TypeKind::Object) {
            return Err(validation(format!(
                "Fragments on abstract type \"{type_name}\" are not supported."
            )));
        }
        Err(validation(format!(
            "Fragment cannot be spread here as objects of type \"{parent}\" can never be of type \"{type_name}\"."
        )))
    }

    fn included(&self, directives: &[Directive<'a, String>]) -> Result<bool, PlanningError> {
        for directive in directives {
            let expected = match directive.name.as_str() {
                "skip" => false,
                "include" => true,
                _ => continue,
            };
            let condition = directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| ast_to_json(value, self.variables))
                .transpose()?;
            match condition {
                Some(Value::Bool(flag)) if flag != expected => return Ok(false),
                Some(Value::Bool(_)) => {}
                _ => {
                    return Err(validation(format!(
                        "Directive \"@{}\" requires a Boolean \"if\" argument.",
                        directive.name
                    )));
                }
            }
        }
        Ok(true)
    }

    fn field_selection(
        &self,
        parent: &str,
        field: &graphql_parser::query::Field<'a, String>,
        visiting: &mut Vec<String>,
    ) -> Result<FieldSelection, PlanningError> {
        let response_key = field.alias.clone().unwrap_or_else(|| field.name.clone());

        if field.name == "__typename" {
            if !field.selection_set.items.is_empty() {
                return Err(validation(
                    "Field \"__typename\" must not have a selection since type \"String!\" has no subfields.",
                ));
            }
            return Ok(FieldSelection {
                response_key,
                alias: field.alias.clone(),
                ..FieldSelection::typename(parent)
            });
        }

        let definition = self.schema.field(parent, &field.name).ok_or_else(|| {
            validation(format!("Cannot query field \"{}\" on type \"{}\".", field.name, parent))
        })?;

        let mut arguments = Vec::new();
        let mut supplied: Vec<&str> = Vec::new();
        for (name, value) in &field.arguments {
            let argument = definition.argument(name).ok_or_else(|| {
                validation(format!(
                    "Unknown argument \"{}\" on field \"{}.{}\".",
                    name, parent, field.name
                ))
            })?;
            // An unsupplied variable leaves the argument out entirely, so the
            // subgraph applies its own default.
            if matches!(value, AstValue::Variable(variable) if self.absent.contains(variable)) {
                continue;
            }
            supplied.push(name.as_str());
            let json = ast_to_json(value, self.variables)?;
            if json.is_null() && argument.ty.is_non_null() {
                return Err(validation(format!(
                    "Argument \"{}\" of non-null type \"{}\" must not be null.",
                    name, argument.ty
                )));
            }
            arguments.push((name.clone(), self.render_literal(&json, &argument.ty)?));
        }
        for argument in &definition.arguments {
            let provided = supplied.contains(&argument.name.as_str());
            if !provided && argument.ty.is_non_null() && !argument.has_default {
                return Err(validation(format!(
                    "Field \"{}.{}\" argument \"{}\" of type \"{}\" is required, but it was not provided.",
                    parent, field.name, argument.name, argument.ty
                )));
            }
        }

        let type_name = definition.ty.type_name();
        let is_leaf = self.schema.is_leaf(type_name);
        let has_selection = !field.selection_set.items.is_empty();
        if is_leaf && has_selection {
            return Err(validation(format!(
                "Field \"{}\" must not have a selection since type \"{}\" has no subfields.",
                field.name, definition.ty
            )));
        }
        if !is_leaf && !has_selection {
            return Err(validation(format!(
                "Field \"{}\" of type \"{}\" must have a selection of subfields. Did you mean \"{} {{ ... }}\"?",
                field.name, definition.ty, field.name
            )));
        }

        let mut selections = Vec::new();
        if has_selection {
            self.collect_fields(type_name, &field.selection_set, visiting, &mut selections)?;
        }

        Ok(FieldSelection {
            response_key,
            name: field.name.clone(),
            alias: field.alias.clone(),
            arguments,
            parent_type: parent.to_string(),
            field_type: definition.ty.clone(),
            selections,
        })
    }

    fn render_literal(&self, value: &Value, ty: &TypeRef) -> Result<String, PlanningError> {
        Ok(match value {
            Value::Null => "null".to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::String(string) => {
                let is_enum = self
                    .schema
                    .get_type(ty.type_name())
                    .is_some_and(|t| t.kind == TypeKind::Enum);
                if is_enum {
                    if !string.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(validation(format!(
                            "Value \"{}\" is not a valid {} enum value.",
                            string,
                            ty.type_name()
                        )));
                    }
                    string.clone()
                } else {
                    // JSON string escapes are valid GraphQL string escapes.
                    Value::String(string.clone()).to_string()
                }
            }
            Value::Array(items) => {
                let item_type = list_item_type(ty);
                let rendered = items
                    .iter()
                    .map(|item| self.render_literal(item, item_type))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("[{}]", rendered.join(", "))
            }
            Value::Object(fields) => {
                let input_type = ty.type_name();
                let mut rendered = Vec::with_capacity(fields.len());
                for (name, item) in fields {
                    let field = self.schema.field(input_type, name).ok_or_else(|| {
                        validation(format!(
                            "Field \"{name}\" is not defined by type \"{input_type}\"."
                        ))
                    })?;
                    rendered.push(format!("{}: {}", name, self.render_literal(item, &field.ty)?));
                }
                format!("{{{}}}", rendered.join(", "))
            }
        })
    }
}

fn list_item_type(ty: &TypeRef) -> &TypeRef {
    match ty {
        TypeRef::NonNull(inner) => list_item_type(inner),
        TypeRef::List(inner) => inner,
        named => named,
    }
}

/// Adds `selection` under its response key, merging sub-selections with an
/// earlier occurrence of the same field.
fn merge_selection(out: &mut Vec<FieldSelection>, selection: FieldSelection) -> Result<(), PlanningError> {
    match out.iter_mut().find(|s| s.response_key == selection.response_key) {
        Some(existing) => {
            if existing.name != selection.name || existing.arguments != selection.arguments {
                return Err(validation(format!(
                    "Fields \"{}\" conflict because they have differing names or arguments.",
                    selection.response_key
                )));
            }
            for child in selection.selections {
                merge_selection(&mut existing.selections, child)?;
            }
            Ok(())
        }
        None => {
            out.push(selection);
            Ok(())
        }
    }
}

struct PlanBuilder<'s> {
    schema: &'s FederatedSchema,
    kind: OperationKind,
    counter: usize,
}

impl<'s> PlanBuilder<'s> {
    fn root_fetches(&mut self, shape: &[FieldSelection]) -> Result<Vec<FetchNode>, PlanningError> {
        let root_type = self.kind.root_type();

        // Consecutive fields of the same subgraph share one fetch. Queries
        // regroup freely since their root fetches are independent.
        let mut groups: Vec<(String, Vec<FieldSelection>)> = Vec::new();
        let mut query_groups: BTreeMap<String, Vec<FieldSelection>> = BTreeMap::new();
        for selection in shape {
            if selection.name == "__typename" {
                continue;
            }
            let service = self
                .schema
                .field(root_type, &selection.name)
                .and_then(|field| field.providers.iter().next())
                .ok_or_else(|| {
                    validation(format!(
                        "No subgraph provides field \"{}.{}\".",
                        root_type, selection.name
                    ))
                })?
                .clone();

            match self.kind {
                OperationKind::Query => query_groups.entry(service).or_default().push(selection.clone()),
                OperationKind::Mutation => match groups.last_mut() {
                    Some((last, fields)) if *last == service => fields.push(selection.clone()),
                    _ => groups.push((service, vec![selection.clone()])),
                },
            }
        }
        if self.kind == OperationKind::Query {
            groups = query_groups.into_iter().collect();
        }

        let mut fetches = Vec::with_capacity(groups.len());
        for (service, fields) in groups {
            let name = self.operation_name(&service);
            let (selections, dependents) = self.split(&service, root_type, &fields, &[])?;
            let operation = format!(
                "{} {} {}",
                self.kind.as_str(),
                name,
                render_selection_set(&selections)
            );
            fetches.push(FetchNode {
                service,
                kind: FetchKind::Root,
                operation,
                selections,
                path: Vec::new(),
                dependents,
            });
        }
        Ok(fetches)
    }

    /// Splits `selections` on `parent` into what `service` can answer itself
    /// and the entity fetches needed for the rest.
    fn split(
        &mut self,
        service: &str,
        parent: &str,
        selections: &[FieldSelection],
        path: &[PathSegment],
    ) -> Result<(Vec<FieldSelection>, Vec<FetchNode>), PlanningError> {
        let mut local: Vec<FieldSelection> = Vec::new();
        let mut dependents = Vec::new();
        let mut remote: Vec<(String, Vec<FieldSelection>)> = Vec::new();
        let parent_is_root = ROOT_TYPES.contains(&parent);

        for selection in selections {
            if selection.name == "__typename" {
                local.push(selection.clone());
                continue;
            }

            if parent_is_root || self.schema.can_provide(parent, &selection.name, service) {
                if selection.selections.is_empty() {
                    local.push(selection.clone());
                    continue;
                }
                let mut child_path = path.to_vec();
                child_path.push(PathSegment::Key(selection.response_key.clone()));
                child_path.extend(std::iter::repeat_n(
                    PathSegment::Flatten,
                    selection.field_type.list_depth(),
                ));
                let (children, nested) = self.split(
                    service,
                    selection.field_type.type_name(),
                    &selection.selections,
                    &child_path,
                )?;
                local.push(FieldSelection {
                    selections: children,
                    ..selection.clone()
                });
                dependents.extend(nested);
                continue;
            }

            let target = self
                .schema
                .entity_service_for(parent, &selection.name)
                .ok_or_else(|| {
                    validation(format!(
                        "Field \"{}.{}\" cannot be fetched from subgraph {}.",
                        parent, selection.name, service
                    ))
                })?
                .to_string();
            match remote.iter_mut().find(|(name, _)| *name == target) {
                Some((_, fields)) => fields.push(selection.clone()),
                None => remote.push((target, vec![selection.clone()])),
            }
        }

        for (target, fields) in remote {
            let key_fields: Vec<String> = self
                .schema
                .key_fields(parent, &target)
                .map(<[String]>::to_vec)
                .unwrap_or_default();

            let typename = FieldSelection::typename(parent);
            check_reserved(selections, &typename)?;
            inject_field(&mut local, typename)?;
            for key in &key_fields {
                let definition = self
                    .schema
                    .field(parent, key)
                    .filter(|_| self.schema.can_provide(parent, key, service))
                    .ok_or_else(|| {
                        validation(format!(
                            "Subgraph {service} cannot provide key field \"{parent}.{key}\"."
                        ))
                    })?;
                let key_field = FieldSelection {
                    response_key: key.clone(),
                    name: key.clone(),
                    alias: None,
                    arguments: Vec::new(),
                    parent_type: parent.to_string(),
                    field_type: definition.ty.clone(),
                    selections: Vec::new(),
                };
                // Fields moved to the entity fetch still land on this object
                // when merged, so the client's whole selection is checked.
                check_reserved(selections, &key_field)?;
                inject_field(&mut local, key_field)?;
            }

            let name = self.operation_name(&target);
            let (entity_selections, nested) = self.split(&target, parent, &fields, path)?;
            let operation = format!(
                "query {}($representations: [_Any!]!) {{ _entities(representations: $representations) {{ ... on {} {} }} }}",
                name,
                parent,
                render_selection_set(&entity_selections)
            );
            dependents.push(FetchNode {
                service: target,
                kind: FetchKind::Entities {
                    type_name: parent.to_string(),
                    key_fields,
                },
                operation,
                selections: entity_selections,
                path: path.to_vec(),
                dependents: nested,
            });
        }

        Ok((local, dependents))
    }

    fn operation_name(&mut self, service: &str) -> String {
        let sanitized: String = service
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let name = format!("Gateway__{}__{}", sanitized, self.counter);
        self.counter += 1;
        name
    }
}

/// Fails when a client field other than `field` itself occupies the
/// response key the gateway needs for entity resolution.
fn check_reserved(selections: &[FieldSelection], field: &FieldSelection) -> Result<(), PlanningError> {
    match selections.iter().find(|s| s.response_key == field.response_key) {
        Some(existing) if existing.name != field.name || !existing.arguments.is_empty() => {
            Err(validation(format!(
                "Response key \"{}\" on type \"{}\" is reserved for entity resolution; use a different alias.",
                field.response_key, field.parent_type
            )))
        }
        _ => Ok(()),
    }
}

/// Adds a field the gateway needs for entity resolution unless the client
/// already selected it.
fn inject_field(selections: &mut Vec<FieldSelection>, field: FieldSelection) -> Result<(), PlanningError> {
    check_reserved(selections, &field)?;
    if !selections.iter().any(|s| s.response_key == field.response_key) {
        selections.push(field);
    }
    Ok(())
}

pub fn render_selection_set(selections: &[FieldSelection]) -> String {
    let mut out = String::from("{");
    for selection in selections {
        out.push(' ');
        if let Some(alias) = &selection.alias {
            out.push_str(alias);
            out.push_str(": ");
        }
        out.push_str(&selection.name);
        if !selection.arguments.is_empty() {
            let arguments: Vec<String> = selection
                .arguments
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect();
            out.push('(');
            out.push_str(&arguments.join(", "));
            out.push(')');
        }
        if !selection.selections.is_empty() {
            out.push(' ');
            out.push_str(&render_selection_set(&selection.selections));
        }
    }
    out.push_str(" }");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::compose;
    use crate::{ServiceConfig, ServiceMap};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> FederatedSchema {
        let subgraphs = [
            ("users", include_str!("../schemas/users.graphql")),
            ("patient", include_str!("../schemas/patient.graphql")),
            ("nurse", include_str!("../schemas/nurse.graphql")),
            ("community", include_str!("../schemas/community.graphql")),
        ];
        let services: ServiceMap = subgraphs
            .iter()
            .map(|(name, sdl)| {
                (
                    name.to_string(),
                    ServiceConfig {
                        name: name.to_string(),
                        url: format!("http://{name}/graphql"),
                        schema: sdl.to_string(),
                    },
                )
            })
            .collect();
        compose(&services).unwrap()
    }

    fn plan(query: &str) -> Result<QueryPlan, PlanningError> {
        SimpleQueryPlanner::new().plan(&GraphQLRequest::new(query), &schema())
    }

    #[test]
    fn test_entity_fetch_for_foreign_fields() {
        let plan = plan("{ post(id: \"p1\") { title author { userName } } }").unwrap();

        assert_eq!(plan.fetches.len(), 1);
        let root = &plan.fetches[0];
        assert_eq!(root.service, "community");
        assert_eq!(
            root.operation,
            "query Gateway__community__0 { post(id: \"p1\") { title author { __typename id } } }"
        );

        assert_eq!(root.dependents.len(), 1);
        let entity = &root.dependents[0];
        assert_eq!(entity.service, "users");
        assert_eq!(
            entity.path,
            vec![PathSegment::Key("post".into()), PathSegment::Key("author".into())]
        );
        assert_eq!(
            entity.kind,
            FetchKind::Entities {
                type_name: "User".into(),
                key_fields: vec!["id".into()],
            }
        );
        assert_eq!(
            entity.operation,
            "query Gateway__users__1($representations: [_Any!]!) { _entities(representations: $representations) { ... on User { userName } } }"
        );
    }

    #[test]
    fn test_lists_flatten_entity_paths() {
        let plan = plan("{ helpRequests { volunteers { email } } }").unwrap();
        let entity = &plan.fetches[0].dependents[0];
        assert_eq!(
            entity.path,
            vec![
                PathSegment::Key("helpRequests".into()),
                PathSegment::Flatten,
                PathSegment::Key("volunteers".into()),
                PathSegment::Flatten,
            ]
        );
    }

    #[test]
    fn test_query_root_fields_grouped_per_subgraph() {
        let plan = plan("{ posts { id } isLoggedIn helpRequests { id } nurses { id } }").unwrap();
        let services: Vec<&str> = plan.fetches.iter().map(|f| f.service.as_str()).collect();
        assert_eq!(services, vec!["community", "nurse", "users"]);
        assert_eq!(plan.fetches[0].selections.len(), 2);
    }

    #[test]
    fn test_mutations_stay_in_order() {
        let plan = plan(
            "mutation { a: createPost(title: \"t\", content: \"c\", category: \"news\") { id } logout b: deletePost(id: \"1\") }",
        )
        .unwrap();
        let services: Vec<&str> = plan.fetches.iter().map(|f| f.service.as_str()).collect();
        assert_eq!(services, vec!["community", "users", "community"]);
        assert!(plan.fetches[0].operation.starts_with("mutation Gateway__community__0"));
    }

    #[test]
    fn test_fragments_directives_and_variables() {
        let request = GraphQLRequest::new(
            r#"
            query Feed($withAuthor: Boolean!, $id: ID! = "p9") {
              post(id: $id) { ...PostFields author @include(if: $withAuthor) { userName } }
            }
            fragment PostFields on Post { title ... on Post { content } }
            "#,
        )
        .with_variables(json!({"withAuthor": false}));

        let plan = SimpleQueryPlanner::new().plan(&request, &schema()).unwrap();
        let root = &plan.fetches[0];
        assert_eq!(
            root.operation,
            "query Gateway__community__0 { post(id: \"p9\") { title content } }"
        );
        assert!(root.dependents.is_empty());
    }

    #[test]
    fn test_variables_are_inlined_with_types() {
        let request = GraphQLRequest::new(
            "mutation($s: SymptomsInput!) { addSymptom(symptoms: $s) { fever } }",
        )
        .with_variables(json!({"s": {"fever": true, "headache": false}}));

        let plan = SimpleQueryPlanner::new().plan(&request, &schema()).unwrap();
        assert_eq!(
            plan.fetches[0].operation,
            "mutation Gateway__patient__0 { addSymptom(symptoms: {fever: true, headache: false}) { fever } }"
        );
    }

    #[test]
    fn test_unsupplied_nullable_variables_drop_their_argument() {
        let query = "mutation($t: String) { updatePost(id: \"1\", title: $t) { id } }";

        let omitted = SimpleQueryPlanner::new().plan(&GraphQLRequest::new(query), &schema()).unwrap();
        assert_eq!(
            omitted.fetches[0].operation,
            "mutation Gateway__community__0 { updatePost(id: \"1\") { id } }"
        );

        let explicit = GraphQLRequest::new(query).with_variables(json!({"t": null}));
        let nulled = SimpleQueryPlanner::new().plan(&explicit, &schema()).unwrap();
        assert_eq!(
            nulled.fetches[0].operation,
            "mutation Gateway__community__0 { updatePost(id: \"1\", title: null) { id } }"
        );

        assert_eq!(
            plan("query($id: ID) { post(id: $id) { id } }").unwrap_err(),
            PlanningError::Validation(
                "Field \"Query.post\" argument \"id\" of type \"ID!\" is required, but it was not provided.".to_string()
            )
        );
    }

    #[test]
    fn test_strings_are_escaped() {
        let request = GraphQLRequest::new("mutation($t: String!) { createPost(title: $t, content: \"x\", category: \"news\") { id } }")
            .with_variables(json!({"t": "say \"hi\"\n"}));
        let plan = SimpleQueryPlanner::new().plan(&request, &schema()).unwrap();
        assert!(plan.fetches[0].operation.contains(r#"title: "say \"hi\"\n""#));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("{ posts { nope } }", "Cannot query field \"nope\" on type \"Post\"."),
            ("{ post { id } }", "Field \"Query.post\" argument \"id\" of type \"ID!\" is required, but it was not provided."),
            ("{ post(id: 1, x: 2) { id } }", "Unknown argument \"x\" on field \"Query.post\"."),
            ("{ posts }", "Field \"posts\" of type \"[Post!]!\" must have a selection of subfields. Did you mean \"posts { ... }\"?"),
            ("{ isLoggedIn { x } }", "Field \"isLoggedIn\" must not have a selection since type \"Boolean!\" has no subfields."),
            ("query($id: ID!) { post(id: $id) { id } }", "Variable \"$id\" of required type \"ID!\" was not provided."),
            ("{ post(id: $missing) { id } }", "Variable \"$missing\" is not defined."),
            ("{ posts { ...Nope } }", "Unknown fragment \"Nope\"."),
            ("{ a: posts { id } a: helpRequests { id } }", "Fields \"a\" conflict because they have differing names or arguments."),
            ("{ posts { author { id: userName } } }", "Response key \"id\" on type \"User\" is reserved for entity resolution; use a different alias."),
            ("{ posts { author { __typename: userName } } }", "Response key \"__typename\" on type \"User\" is reserved for entity resolution; use a different alias."),
            ("{ posts { author { id: email userName } } }", "Response key \"id\" on type \"User\" is reserved for entity resolution; use a different alias."),
        ];

        for (query, message) in cases {
            assert_eq!(
                plan(query).unwrap_err(),
                PlanningError::Validation(message.to_string()),
                "query: {query}"
            );
        }
    }

    #[test]
    fn test_parse_error() {
        let err = plan("{ posts { id }").unwrap_err();
        assert_eq!(err.code(), "GRAPHQL_PARSE_FAILED");
    }

    #[test]
    fn test_nested_entity_after_entity() {
        // Nurse.assignedPatients are users; the user fields come from users.
        let plan = plan("{ nurses { assignedPatients { userName role } } }").unwrap();
        let root = &plan.fetches[0];
        assert_eq!(root.service, "nurse");
        assert_eq!(
            root.operation,
            "query Gateway__nurse__0 { nurses { assignedPatients { __typename id } } }"
        );
        assert_eq!(root.dependents[0].service, "users");
    }
}
