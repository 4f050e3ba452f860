//! Supergraph composition.
//!
//! Each subgraph publishes SDL annotated with federation directives. Both the
//! Federation 1 dialect (`extend type User @key(fields: "id")` with
//! `@external` fields) and the Federation 2 dialect (`@key(..., resolvable:
//! false)`, `@shareable`) are understood. The result records, for every field
//! of every type, which subgraphs can provide it, and for every entity which
//! subgraphs can resolve references to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use graphql_parser::schema::{self, Definition, TypeDefinition, TypeExtension, parse_schema};

use crate::error::CompositionError;
use crate::{ServiceConfig, ServiceMap};

pub const ROOT_TYPES: [&str; 3] = ["Query", "Mutation", "Subscription"];
const BUILT_IN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    /// The innermost named type.
    pub fn type_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.type_name(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// Number of list wrappers between the field and its named type.
    pub fn list_depth(&self) -> usize {
        match self {
            TypeRef::Named(_) => 0,
            TypeRef::NonNull(inner) => inner.list_depth(),
            TypeRef::List(inner) => 1 + inner.list_depth(),
        }
    }

    pub fn from_ast<'a>(ty: &schema::Type<'a, String>) -> Self {
        match ty {
            schema::Type::NamedType(name) => TypeRef::Named(name.clone()),
            schema::Type::ListType(inner) => TypeRef::List(Box::new(TypeRef::from_ast(inner))),
            schema::Type::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from_ast(inner))),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input object",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub arguments: Vec<ArgumentDefinition>,
    /// Subgraphs able to return this field on an object they are resolving.
    pub providers: BTreeSet<String>,
}

impl FieldDefinition {
    pub fn argument(&self, name: &str) -> Option<&ArgumentDefinition> {
        self.arguments.iter().find(|arg| arg.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    pub fields: Vec<String>,
    pub resolvable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeType {
    pub name: String,
    pub kind: TypeKind,
    pub fields: BTreeMap<String, FieldDefinition>,
    /// `@key` declarations per subgraph. Empty for value types.
    pub keys: BTreeMap<String, EntityKey>,
    /// Enum values or union members.
    pub members: BTreeSet<String>,
}

impl CompositeType {
    pub fn is_entity(&self) -> bool {
        !self.keys.is_empty()
    }
}

/// The composed supergraph.
#[derive(Clone, Debug)]
pub struct FederatedSchema {
    pub services: ServiceMap,
    pub types: HashMap<String, CompositeType>,
}

impl FederatedSchema {
    pub fn get_type(&self, name: &str) -> Option<&CompositeType> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDefinition> {
        self.types.get(type_name)?.fields.get(field)
    }

    pub fn is_entity(&self, type_name: &str) -> bool {
        self.types.get(type_name).is_some_and(CompositeType::is_entity)
    }

    pub fn is_leaf(&self, type_name: &str) -> bool {
        BUILT_IN_SCALARS.contains(&type_name)
            || self
                .types
                .get(type_name)
                .is_some_and(|t| matches!(t.kind, TypeKind::Scalar | TypeKind::Enum))
    }

    pub fn is_input(&self, type_name: &str) -> bool {
        self.is_leaf(type_name)
            || self
                .types
                .get(type_name)
                .is_some_and(|t| t.kind == TypeKind::InputObject)
    }

    pub fn can_provide(&self, type_name: &str, field: &str, service: &str) -> bool {
        self.field(type_name, field)
            .is_some_and(|f| f.providers.contains(service))
    }

    /// The subgraph that answers `_entities` requests for `type_name.field`.
    pub fn entity_service_for(&self, type_name: &str, field: &str) -> Option<&str> {
        let entity = self.types.get(type_name)?;
        let definition = entity.fields.get(field)?;
        definition
            .providers
            .iter()
            .find(|service| entity.keys.get(*service).is_some_and(|key| key.resolvable))
            .map(String::as_str)
    }

    /// Key fields of `type_name` as declared by `service`, falling back to any
    /// declared key when the service references the entity without one.
    pub fn key_fields(&self, type_name: &str, service: &str) -> Option<&[String]> {
        let entity = self.types.get(type_name)?;
        entity
            .keys
            .get(service)
            .or_else(|| entity.keys.values().next())
            .map(|key| key.fields.as_slice())
    }

    /// Names of the subgraphs, in a stable order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
struct SubgraphField {
    name: String,
    ty: TypeRef,
    arguments: Vec<ArgumentDefinition>,
    external: bool,
    shareable: bool,
}

#[derive(Debug, Clone)]
struct SubgraphType {
    kind: TypeKind,
    keys: Vec<EntityKey>,
    shareable: bool,
    fields: Vec<SubgraphField>,
    members: Vec<String>,
}

/// Composes the given subgraphs into a supergraph, or explains why they
/// cannot be merged.
pub fn compose(services: &ServiceMap) -> Result<FederatedSchema, CompositionError> {
    // service -> type name -> declaration
    let mut declarations: BTreeMap<&str, BTreeMap<String, SubgraphType>> = BTreeMap::new();
    for (name, service) in services {
        declarations.insert(name, collect_types(service)?);
    }

    let mut types: HashMap<String, CompositeType> = HashMap::new();
    let mut kind_origin: HashMap<String, String> = HashMap::new();

    // Kinds, keys and members first, so field rules can tell entities apart.
    for (&service, service_types) in &declarations {
        for (type_name, declared) in service_types {
            let composite = types.entry(type_name.clone()).or_insert_with(|| {
                kind_origin.insert(type_name.clone(), service.to_string());
                CompositeType {
                    name: type_name.clone(),
                    kind: declared.kind,
                    fields: BTreeMap::new(),
                    keys: BTreeMap::new(),
                    members: BTreeSet::new(),
                }
            });
            if composite.kind != declared.kind {
                return Err(CompositionError::KindConflict {
                    type_name: type_name.clone(),
                    first: composite.kind.as_str(),
                    first_service: kind_origin[type_name].clone(),
                    second: declared.kind.as_str(),
                    second_service: service.to_string(),
                });
            }
            if let Some(key) = merge_keys(type_name, service, &declared.keys, &declared.fields)? {
                composite.keys.insert(service.to_string(), key);
            }
            composite.members.extend(declared.members.iter().cloned());
        }
    }

    // field -> services that declare it without @external
    let mut declared_by: HashMap<(String, String), BTreeSet<String>> = HashMap::new();
    // field -> owning services (non-key, non-external) with their shareability
    let mut owners: HashMap<(String, String), Vec<(String, bool)>> = HashMap::new();
    let mut externals: Vec<(String, String, String)> = Vec::new();
    let mut type_origin: HashMap<(String, String), (TypeRef, String)> = HashMap::new();

    for (&service, service_types) in &declarations {
        for (type_name, declared) in service_types {
            let Some(composite) = types.get_mut(type_name) else {
                continue;
            };
            let is_root = ROOT_TYPES.contains(&type_name.as_str());
            let all_key_fields: BTreeSet<&String> =
                composite.keys.values().flat_map(|k| k.fields.iter()).collect();
            let service_key = composite.keys.get(service).cloned();

            for field in &declared.fields {
                let slot = (type_name.clone(), field.name.clone());

                // Root fields have exactly one owner, whatever their types.
                if is_root {
                    if let Some((_, first)) = type_origin.get(&slot) {
                        return Err(CompositionError::RootFieldConflict {
                            type_name: type_name.clone(),
                            field: field.name.clone(),
                            first: first.clone(),
                            second: service.to_string(),
                        });
                    }
                }

                match type_origin.get(&slot) {
                    Some((ty, origin)) if *ty != field.ty => {
                        return Err(CompositionError::FieldTypeConflict {
                            type_name: type_name.clone(),
                            field: field.name.clone(),
                            first: ty.to_string(),
                            first_service: origin.clone(),
                            second: field.ty.to_string(),
                            second_service: service.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        type_origin.insert(slot.clone(), (field.ty.clone(), service.to_string()));
                    }
                }

                let definition = composite
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldDefinition {
                        name: field.name.clone(),
                        ty: field.ty.clone(),
                        arguments: field.arguments.clone(),
                        providers: BTreeSet::new(),
                    });

                if is_root {
                    definition.providers.insert(service.to_string());
                    continue;
                }

                let is_key = match &service_key {
                    Some(key) => key.fields.contains(&field.name),
                    None => composite.kind == TypeKind::Object && all_key_fields.contains(&field.name),
                };

                if field.external {
                    externals.push((type_name.clone(), field.name.clone(), service.to_string()));
                    if is_key {
                        definition.providers.insert(service.to_string());
                    }
                    continue;
                }

                if definition.arguments.is_empty() && !field.arguments.is_empty() {
                    definition.arguments = field.arguments.clone();
                }
                definition.providers.insert(service.to_string());
                declared_by
                    .entry(slot.clone())
                    .or_default()
                    .insert(service.to_string());

                if composite.is_entity() && !is_key {
                    let shareable = field.shareable || declared.shareable;
                    let field_owners = owners.entry(slot).or_default();
                    if let Some((first, first_shareable)) = field_owners.first() {
                        if !(shareable && *first_shareable) {
                            return Err(CompositionError::OwnershipConflict {
                                type_name: type_name.clone(),
                                field: field.name.clone(),
                                first: first.clone(),
                                second: service.to_string(),
                            });
                        }
                    }
                    field_owners.push((service.to_string(), shareable));
                }
            }
        }
    }

    for (type_name, field, service) in externals {
        let provided = declared_by
            .get(&(type_name.clone(), field.clone()))
            .is_some_and(|set| !set.is_empty());
        if !provided {
            return Err(CompositionError::UnsatisfiedExternal {
                type_name,
                field,
                service,
            });
        }
    }

    for composite in types.values() {
        if !composite.is_entity() {
            continue;
        }
        let declaring: BTreeSet<&str> = declarations
            .iter()
            .filter(|(_, service_types)| service_types.contains_key(&composite.name))
            .map(|(service, _)| *service)
            .collect();
        for definition in composite.fields.values() {
            let everywhere = declaring
                .iter()
                .all(|service| definition.providers.contains(*service));
            let resolvable = definition.providers.iter().any(|service| {
                composite
                    .keys
                    .get(service)
                    .is_some_and(|key| key.resolvable)
            });
            if !everywhere && !resolvable {
                return Err(CompositionError::UnresolvableEntityField {
                    type_name: composite.name.clone(),
                    field: definition.name.clone(),
                });
            }
        }
    }

    Ok(FederatedSchema {
        services: services.clone(),
        types,
    })
}

fn merge_keys(
    type_name: &str,
    service: &str,
    keys: &[EntityKey],
    fields: &[SubgraphField],
) -> Result<Option<EntityKey>, CompositionError> {
    let Some(first) = keys.first() else {
        return Ok(None);
    };
    for key in keys {
        for field in &key.fields {
            if !fields.iter().any(|f| &f.name == field) {
                return Err(CompositionError::UnsupportedKey {
                    type_name: type_name.to_string(),
                    service: service.to_string(),
                    reason: format!("key field {field} is not declared on the type"),
                });
            }
        }
    }
    // The first declared key is the one used for references.
    Ok(Some(EntityKey {
        fields: first.fields.clone(),
        resolvable: keys.iter().any(|key| key.resolvable),
    }))
}

fn collect_types(service: &ServiceConfig) -> Result<BTreeMap<String, SubgraphType>, CompositionError> {
    let sdl = strip_schema_definitions(&service.schema);
    let document = parse_schema::<String>(&sdl).map_err(|e| CompositionError::Parse {
        service: service.name.clone(),
        message: e.to_string(),
    })?;

    let mut types: BTreeMap<String, SubgraphType> = BTreeMap::new();
    for definition in &document.definitions {
        let (name, declared) = match definition {
            Definition::TypeDefinition(typedef) => match typedef {
                TypeDefinition::Object(obj) => (
                    &obj.name,
                    object_like(service, &obj.name, TypeKind::Object, &obj.directives, &obj.fields)?,
                ),
                TypeDefinition::Interface(iface) => (
                    &iface.name,
                    object_like(service, &iface.name, TypeKind::Interface, &iface.directives, &iface.fields)?,
                ),
                TypeDefinition::Union(union_type) => (
                    &union_type.name,
                    member_only(TypeKind::Union, union_type.types.clone()),
                ),
                TypeDefinition::Enum(enum_type) => (
                    &enum_type.name,
                    member_only(
                        TypeKind::Enum,
                        enum_type.values.iter().map(|v| v.name.clone()).collect(),
                    ),
                ),
                TypeDefinition::Scalar(scalar) => (&scalar.name, member_only(TypeKind::Scalar, Vec::new())),
                TypeDefinition::InputObject(input) => (&input.name, input_object(&input.fields)),
            },
            Definition::TypeExtension(extension) => match extension {
                TypeExtension::Object(obj) => (
                    &obj.name,
                    object_like(service, &obj.name, TypeKind::Object, &obj.directives, &obj.fields)?,
                ),
                TypeExtension::Interface(iface) => (
                    &iface.name,
                    object_like(service, &iface.name, TypeKind::Interface, &iface.directives, &iface.fields)?,
                ),
                TypeExtension::Union(union_type) => (
                    &union_type.name,
                    member_only(TypeKind::Union, union_type.types.clone()),
                ),
                TypeExtension::Enum(enum_type) => (
                    &enum_type.name,
                    member_only(
                        TypeKind::Enum,
                        enum_type.values.iter().map(|v| v.name.clone()).collect(),
                    ),
                ),
                TypeExtension::Scalar(scalar) => (&scalar.name, member_only(TypeKind::Scalar, Vec::new())),
                TypeExtension::InputObject(input) => (&input.name, input_object(&input.fields)),
            },
            _ => continue,
        };

        if is_federation_internal(name) || BUILT_IN_SCALARS.contains(&name.as_str()) {
            continue;
        }

        match types.get_mut(name) {
            Some(existing) => {
                existing.keys.extend(declared.keys);
                existing.shareable |= declared.shareable;
                existing.members.extend(declared.members);
                for field in declared.fields {
                    if !existing.fields.iter().any(|f| f.name == field.name) {
                        existing.fields.push(field);
                    }
                }
            }
            None => {
                types.insert(name.clone(), declared);
            }
        }
    }

    Ok(types)
}

fn is_federation_internal(name: &str) -> bool {
    name.starts_with('_') || name.contains("__")
}

fn member_only(kind: TypeKind, members: Vec<String>) -> SubgraphType {
    SubgraphType {
        kind,
        keys: Vec::new(),
        shareable: false,
        fields: Vec::new(),
        members,
    }
}

fn input_object<'a>(fields: &[schema::InputValue<'a, String>]) -> SubgraphType {
    SubgraphType {
        kind: TypeKind::InputObject,
        keys: Vec::new(),
        shareable: false,
        fields: fields
            .iter()
            .map(|field| SubgraphField {
                name: field.name.clone(),
                ty: TypeRef::from_ast(&field.value_type),
                arguments: Vec::new(),
                external: false,
                shareable: true,
            })
            .collect(),
        members: Vec::new(),
    }
}

fn object_like<'a>(
    service: &ServiceConfig,
    type_name: &str,
    kind: TypeKind,
    directives: &[schema::Directive<'a, String>],
    fields: &[schema::Field<'a, String>],
) -> Result<SubgraphType, CompositionError> {
    let mut keys = Vec::new();
    for directive in directives.iter().filter(|d| d.name == "key") {
        keys.push(parse_key(service, type_name, directive)?);
    }

    let fields = fields
        .iter()
        .filter(|field| !field.name.starts_with('_'))
        .map(|field| SubgraphField {
            name: field.name.clone(),
            ty: TypeRef::from_ast(&field.field_type),
            arguments: field
                .arguments
                .iter()
                .map(|arg| ArgumentDefinition {
                    name: arg.name.clone(),
                    ty: TypeRef::from_ast(&arg.value_type),
                    has_default: arg.default_value.is_some(),
                })
                .collect(),
            external: has_directive(&field.directives, "external"),
            shareable: has_directive(&field.directives, "shareable"),
        })
        .collect();

    Ok(SubgraphType {
        kind,
        keys,
        shareable: has_directive(directives, "shareable"),
        fields,
        members: Vec::new(),
    })
}

fn has_directive<'a>(directives: &[schema::Directive<'a, String>], name: &str) -> bool {
    directives.iter().any(|d| d.name == name)
}

fn parse_key<'a>(
    service: &ServiceConfig,
    type_name: &str,
    directive: &schema::Directive<'a, String>,
) -> Result<EntityKey, CompositionError> {
    let unsupported = |reason: &str| CompositionError::UnsupportedKey {
        type_name: type_name.to_string(),
        service: service.name.clone(),
        reason: reason.to_string(),
    };

    let mut fields = None;
    let mut resolvable = true;
    for (name, value) in &directive.arguments {
        match (name.as_str(), value) {
            ("fields", schema::Value::String(selection)) => fields = Some(selection.clone()),
            ("resolvable", schema::Value::Boolean(flag)) => resolvable = *flag,
            ("fields", _) => return Err(unsupported("`fields` must be a string")),
            _ => {}
        }
    }

    let selection = fields.ok_or_else(|| unsupported("missing `fields` argument"))?;
    if selection.contains('{') || selection.contains('}') {
        return Err(unsupported("nested key field sets are not supported"));
    }
    let fields: Vec<String> = selection.split_whitespace().map(str::to_string).collect();
    if fields.is_empty() {
        return Err(unsupported("empty key field set"));
    }

    Ok(EntityKey { fields, resolvable })
}

const DEFINITION_KEYWORDS: [&str; 9] = [
    "schema",
    "extend",
    "type",
    "interface",
    "union",
    "enum",
    "input",
    "scalar",
    "directive",
];

/// Removes `schema { ... }` and `extend schema ...` definitions. Root types
/// are always `Query`/`Mutation` for the gateway, and federation 2 `@link`
/// schema extensions carry nothing the composer needs.
pub fn strip_schema_definitions(sdl: &str) -> String {
    let bytes = sdl.as_bytes();
    // (start offset, is a schema definition)
    let mut definitions: Vec<(usize, bool)> = Vec::new();
    let mut depth: usize = 0;
    let mut description_start: Option<usize> = None;
    let mut after_extend = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'"' => {
                let start = i;
                if bytes[i..].starts_with(b"\"\"\"") {
                    i += 3;
                    while i < bytes.len() && !bytes[i..].starts_with(b"\"\"\"") {
                        i += if bytes[i] == b'\\' { 2 } else { 1 };
                    }
                    i += 3;
                } else {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                        i += if bytes[i] == b'\\' { 2 } else { 1 };
                    }
                    i += 1;
                }
                if depth == 0 && description_start.is_none() {
                    description_start = Some(start);
                }
                continue;
            }
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => depth = depth.saturating_sub(1),
            b'@' => {
                // Skip the directive name so it is never read as a keyword.
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                if depth == 0 {
                    let word = &sdl[start..i];
                    if after_extend {
                        after_extend = false;
                        if word == "schema" {
                            if let Some(last) = definitions.last_mut() {
                                last.1 = true;
                            }
                        }
                    } else if DEFINITION_KEYWORDS.contains(&word) {
                        let begin = description_start.take().unwrap_or(start);
                        definitions.push((begin, word == "schema"));
                        after_extend = word == "extend";
                    }
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    if !definitions.iter().any(|(_, is_schema)| *is_schema) {
        return sdl.to_string();
    }

    let mut out = String::with_capacity(sdl.len());
    out.push_str(&sdl[..definitions.first().map_or(sdl.len(), |d| d.0)]);
    for (index, (start, is_schema)) in definitions.iter().enumerate() {
        let end = definitions.get(index + 1).map_or(sdl.len(), |next| next.0);
        if !is_schema {
            out.push_str(&sdl[*start..end]);
        }
    }
    out
}
