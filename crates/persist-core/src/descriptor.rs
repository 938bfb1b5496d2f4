//! Class descriptors: how an entity maps onto a table, and how it is cached.
//!
//! A [`Project`] owns every [`ClassDescriptor`]. Calling
//! [`Project::initialize`] validates the mappings and propagates cache
//! isolation upward through relationships and embeddables, so that a type
//! which can reach a non-shared type is never fully shared itself.

use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Cache isolation and timeouts
// ============================================================================

/// How instances of a type participate in the shared (second-level) cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CacheIsolation {
    /// Fully cached, relationships included.
    #[default]
    Shared,
    /// Basic attributes are cached; relationships to non-shared targets are
    /// re-resolved in each unit of work.
    Protected,
    /// Never stored in the shared cache.
    Isolated,
}

impl CacheIsolation {
    pub const fn is_shared(self) -> bool {
        matches!(self, CacheIsolation::Shared)
    }

    pub const fn is_isolated(self) -> bool {
        matches!(self, CacheIsolation::Isolated)
    }
}

/// A query timeout setting.
///
/// `Default` defers to the next level (query → descriptor → session);
/// `NoTimeout` stops the cascade with "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum QueryTimeout {
    #[default]
    Default,
    NoTimeout,
    Limit(Duration),
}

impl QueryTimeout {
    pub fn seconds(secs: u64) -> Self {
        QueryTimeout::Limit(Duration::from_secs(secs))
    }

    pub fn millis(ms: u64) -> Self {
        QueryTimeout::Limit(Duration::from_millis(ms))
    }

    /// Fall through to `fallback` only when this level says `Default`.
    pub const fn or(self, fallback: QueryTimeout) -> QueryTimeout {
        match self {
            QueryTimeout::Default => fallback,
            other => other,
        }
    }

    /// The effective limit once the cascade is resolved.
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            QueryTimeout::Limit(d) => Some(d),
            QueryTimeout::Default | QueryTimeout::NoTimeout => None,
        }
    }
}

// ============================================================================
// Attribute types
// ============================================================================

/// Declared type of a basic attribute or query argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Integer,
    Float,
    Text,
    Boolean,
    Bytes,
    Json,
}

impl AttributeType {
    /// Whether `value` may be bound for this type. NULL is always accepted.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (AttributeType::Integer, Value::Int(_) | Value::BigInt(_)) => true,
            (
                AttributeType::Float,
                Value::Double(_) | Value::Int(_) | Value::BigInt(_) | Value::Decimal(_),
            ) => true,
            (AttributeType::Text, Value::Text(_)) => true,
            (AttributeType::Boolean, Value::Bool(_)) => true,
            (AttributeType::Bytes, Value::Bytes(_)) => true,
            (AttributeType::Json, _) => true,
            _ => false,
        }
    }

    /// Convert a raw column value into the attribute's canonical form.
    pub fn from_column(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (AttributeType::Integer, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (AttributeType::Float, Value::Int(v)) => Value::Double(f64::from(v)),
            (AttributeType::Float, Value::BigInt(v)) => Value::Double(v as f64),
            (AttributeType::Boolean, v @ (Value::Int(_) | Value::BigInt(_))) => {
                Value::Bool(v.as_i64().is_some_and(|i| i != 0))
            }
            (AttributeType::Json, Value::Text(s)) => serde_json::from_str(&s)
                .map_or(Value::Text(s), Value::Json),
            (_, v) => v,
        }
    }

    /// Convert an incoming JSON value into an attribute value.
    pub fn from_json(self, json: &serde_json::Value) -> Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self {
            AttributeType::Integer => json.as_i64().map(Value::BigInt),
            AttributeType::Float => json.as_f64().map(Value::Double),
            AttributeType::Text => json.as_str().map(|s| Value::Text(s.to_string())),
            AttributeType::Boolean => json.as_bool().map(Value::Bool),
            AttributeType::Bytes => json.as_array().and_then(|items| {
                items
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Value::Bytes)
            }),
            AttributeType::Json => Some(Value::Json(json.clone())),
        };
        converted.ok_or_else(|| {
            Error::illegal_argument(format!("expected {:?} value, got {}", self, json))
        })
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// Cardinality of a single-valued relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    ManyToOne,
}

/// One attribute's mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    /// A basic attribute stored in one column.
    Direct {
        attribute: String,
        column: String,
        attribute_type: AttributeType,
    },
    /// A single-valued relationship; the foreign key lives on this table.
    Reference {
        attribute: String,
        target: String,
        foreign_key: String,
        cardinality: Cardinality,
    },
    /// A collection whose foreign key lives on the target, owned by the
    /// target's `mapped_by` reference attribute.
    Collection {
        attribute: String,
        target: String,
        mapped_by: String,
    },
    /// An embeddable whose columns are stored on this table.
    Embedded {
        attribute: String,
        embeddable: String,
    },
}

impl Mapping {
    pub fn attribute(&self) -> &str {
        match self {
            Mapping::Direct { attribute, .. }
            | Mapping::Reference { attribute, .. }
            | Mapping::Collection { attribute, .. }
            | Mapping::Embedded { attribute, .. } => attribute,
        }
    }

    /// The related type for relationship and embedded mappings.
    pub fn target(&self) -> Option<&str> {
        match self {
            Mapping::Direct { .. } => None,
            Mapping::Reference { target, .. } | Mapping::Collection { target, .. } => Some(target),
            Mapping::Embedded { embeddable, .. } => Some(embeddable),
        }
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, Mapping::Reference { .. } | Mapping::Collection { .. })
    }
}

/// Descriptor-level SQL that replaces the generated SQL for default queries.
///
/// Arguments are written `#name`, named after primary-key attributes for
/// `read_object`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOverrides {
    pub read_object: Option<String>,
    pub read_all: Option<String>,
}

impl QueryOverrides {
    pub fn is_empty(&self) -> bool {
        self.read_object.is_none() && self.read_all.is_none()
    }
}

// ============================================================================
// Class descriptor
// ============================================================================

/// Default number of instances kept per type in the shared cache.
pub const DEFAULT_IDENTITY_MAP_SIZE: usize = 100;

/// Mapping and caching metadata for one entity or embeddable type.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDescriptor {
    entity_name: String,
    table: String,
    primary_key: Vec<String>,
    mappings: Vec<Mapping>,
    isolation: CacheIsolation,
    embeddable: bool,
    query_timeout: QueryTimeout,
    identity_map_size: usize,
    version_attribute: Option<String>,
    generated_id: bool,
    query_overrides: QueryOverrides,
}

impl ClassDescriptor {
    /// Describe an entity stored in `table`.
    pub fn entity(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_name: name.into(),
            table: table.into(),
            primary_key: Vec::new(),
            mappings: Vec::new(),
            isolation: CacheIsolation::Shared,
            embeddable: false,
            query_timeout: QueryTimeout::Default,
            identity_map_size: DEFAULT_IDENTITY_MAP_SIZE,
            version_attribute: None,
            generated_id: false,
            query_overrides: QueryOverrides::default(),
        }
    }

    /// Describe an embeddable; its columns live on the embedding table.
    pub fn embeddable(name: impl Into<String>) -> Self {
        let mut desc = Self::entity(name, "");
        desc.embeddable = true;
        desc
    }

    /// Add a primary-key attribute.
    pub fn id(
        mut self,
        attribute: impl Into<String>,
        column: impl Into<String>,
        attribute_type: AttributeType,
    ) -> Self {
        let attribute = attribute.into();
        self.primary_key.push(attribute.clone());
        self.direct(attribute, column, attribute_type)
    }

    /// The single primary-key column is assigned by the database on insert.
    pub fn generated_id(mut self) -> Self {
        self.generated_id = true;
        self
    }

    pub fn direct(
        mut self,
        attribute: impl Into<String>,
        column: impl Into<String>,
        attribute_type: AttributeType,
    ) -> Self {
        self.mappings.push(Mapping::Direct {
            attribute: attribute.into(),
            column: column.into(),
            attribute_type,
        });
        self
    }

    pub fn one_to_one(
        self,
        attribute: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.reference(attribute, target, foreign_key, Cardinality::OneToOne)
    }

    pub fn many_to_one(
        self,
        attribute: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.reference(attribute, target, foreign_key, Cardinality::ManyToOne)
    }

    fn reference(
        mut self,
        attribute: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.mappings.push(Mapping::Reference {
            attribute: attribute.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
            cardinality,
        });
        self
    }

    pub fn one_to_many(
        mut self,
        attribute: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        self.mappings.push(Mapping::Collection {
            attribute: attribute.into(),
            target: target.into(),
            mapped_by: mapped_by.into(),
        });
        self
    }

    pub fn embedded(mut self, attribute: impl Into<String>, embeddable: impl Into<String>) -> Self {
        self.mappings.push(Mapping::Embedded {
            attribute: attribute.into(),
            embeddable: embeddable.into(),
        });
        self
    }

    /// Add an integer version attribute used for optimistic locking.
    pub fn version(mut self, attribute: impl Into<String>, column: impl Into<String>) -> Self {
        let attribute = attribute.into();
        self.version_attribute = Some(attribute.clone());
        self.direct(attribute, column, AttributeType::Integer)
    }

    pub fn isolation(mut self, isolation: CacheIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn query_timeout(mut self, timeout: QueryTimeout) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn identity_map_size(mut self, size: usize) -> Self {
        self.identity_map_size = size;
        self
    }

    pub fn custom_read_object_sql(mut self, sql: impl Into<String>) -> Self {
        self.query_overrides.read_object = Some(sql.into());
        self
    }

    pub fn custom_read_all_sql(mut self, sql: impl Into<String>) -> Self {
        self.query_overrides.read_all = Some(sql.into());
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn mapping(&self, attribute: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.attribute() == attribute)
    }

    pub fn cache_isolation(&self) -> CacheIsolation {
        self.isolation
    }

    pub fn is_embeddable(&self) -> bool {
        self.embeddable
    }

    pub fn timeout(&self) -> QueryTimeout {
        self.query_timeout
    }

    pub fn cache_size(&self) -> usize {
        self.identity_map_size
    }

    pub fn version_attribute(&self) -> Option<&str> {
        self.version_attribute.as_deref()
    }

    pub fn has_generated_id(&self) -> bool {
        self.generated_id
    }

    pub fn overrides(&self) -> &QueryOverrides {
        &self.query_overrides
    }

    /// Column of a direct attribute.
    pub fn direct_column(&self, attribute: &str) -> Option<&str> {
        match self.mapping(attribute)? {
            Mapping::Direct { column, .. } => Some(column),
            _ => None,
        }
    }

    /// Declared type of a direct attribute.
    pub fn attribute_type(&self, attribute: &str) -> Option<AttributeType> {
        match self.mapping(attribute)? {
            Mapping::Direct { attribute_type, .. } => Some(*attribute_type),
            _ => None,
        }
    }

    /// Primary-key columns, in key order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.primary_key
            .iter()
            .filter_map(|attr| self.direct_column(attr))
            .collect()
    }
}

// ============================================================================
// Project
// ============================================================================

/// The set of descriptors making up one persistence unit.
#[derive(Debug, Clone, Default)]
pub struct Project {
    descriptors: BTreeMap<String, ClassDescriptor>,
    initialized: bool,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor (builder style).
    pub fn with(mut self, descriptor: ClassDescriptor) -> Self {
        self.add_descriptor(descriptor);
        self
    }

    pub fn add_descriptor(&mut self, descriptor: ClassDescriptor) {
        self.initialized = false;
        self.descriptors
            .insert(descriptor.entity_name.clone(), descriptor);
    }

    pub fn descriptor(&self, entity: &str) -> Option<&ClassDescriptor> {
        self.descriptors.get(entity)
    }

    /// Look up a descriptor, failing with a not-found usage error.
    pub fn require(&self, entity: &str) -> Result<&ClassDescriptor> {
        self.descriptors
            .get(entity)
            .ok_or_else(|| Error::not_found(format!("unknown entity type '{}'", entity)))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.descriptors.values()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether instances of `entity` may be fully shared.
    pub fn is_shared_isolation(&self, entity: &str) -> bool {
        self.descriptor(entity)
            .is_some_and(|d| d.isolation.is_shared())
    }

    /// Validate every descriptor and propagate cache isolation.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn initialize(&mut self) -> Result<()> {
        for desc in self.descriptors.values() {
            self.validate(desc)?;
        }
        self.propagate_isolation();
        self.initialized = true;
        tracing::debug!(
            descriptors = self.descriptors.len(),
            "Project initialized"
        );
        Ok(())
    }

    fn validate(&self, desc: &ClassDescriptor) -> Result<()> {
        let name = &desc.entity_name;
        if !desc.embeddable {
            if desc.table.is_empty() {
                return Err(Error::config(format!("entity '{}' has no table", name)));
            }
            if desc.primary_key.is_empty() {
                return Err(Error::config(format!(
                    "entity '{}' has no primary key",
                    name
                )));
            }
        }
        if desc.generated_id && desc.primary_key.len() != 1 {
            return Err(Error::config(format!(
                "entity '{}' uses a generated id but has a composite key",
                name
            )));
        }
        for pk in &desc.primary_key {
            if desc.direct_column(pk).is_none() {
                return Err(Error::config(format!(
                    "primary key attribute '{}.{}' must be a direct mapping",
                    name, pk
                )));
            }
        }
        if let Some(version) = &desc.version_attribute {
            if desc.attribute_type(version) != Some(AttributeType::Integer) {
                return Err(Error::config(format!(
                    "version attribute '{}.{}' must be an integer",
                    name, version
                )));
            }
        }
        for mapping in &desc.mappings {
            match mapping {
                Mapping::Direct { .. } => {}
                Mapping::Reference { target, .. } => {
                    let target_desc = self.require_config(name, target)?;
                    if target_desc.embeddable || target_desc.primary_key.len() != 1 {
                        return Err(Error::config(format!(
                            "reference '{}.{}' must target an entity with a single-column key",
                            name,
                            mapping.attribute()
                        )));
                    }
                }
                Mapping::Collection {
                    target, mapped_by, ..
                } => {
                    if desc.embeddable {
                        return Err(Error::config(format!(
                            "embeddable '{}' cannot own a collection",
                            name
                        )));
                    }
                    let target_desc = self.require_config(name, target)?;
                    match target_desc.mapping(mapped_by) {
                        Some(Mapping::Reference { target: back, .. }) if back == name => {}
                        _ => {
                            return Err(Error::config(format!(
                                "collection '{}.{}' is mapped by '{}.{}', which is not a reference back to '{}'",
                                name,
                                mapping.attribute(),
                                target,
                                mapped_by,
                                name
                            )));
                        }
                    }
                }
                Mapping::Embedded { embeddable, .. } => {
                    let target_desc = self.require_config(name, embeddable)?;
                    if !target_desc.embeddable {
                        return Err(Error::config(format!(
                            "'{}.{}' embeds '{}', which is not an embeddable",
                            name,
                            mapping.attribute(),
                            embeddable
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn require_config(&self, owner: &str, target: &str) -> Result<&ClassDescriptor> {
        self.descriptors.get(target).ok_or_else(|| {
            Error::config(format!(
                "'{}' refers to unknown type '{}'",
                owner, target
            ))
        })
    }

    /// Isolation is contagious upward: any type whose relationships or
    /// embeddables reach a non-shared type becomes at least protected.
    /// Iterates to a fixpoint so chains of embeddables are covered.
    fn propagate_isolation(&mut self) {
        loop {
            let upgrades: Vec<(String, String)> = self
                .descriptors
                .values()
                .filter(|d| d.isolation.is_shared())
                .filter_map(|d| {
                    d.mappings.iter().find_map(|m| {
                        let target = m.target()?;
                        let target_iso = self.descriptors.get(target)?.isolation;
                        (!target_iso.is_shared())
                            .then(|| (d.entity_name.clone(), target.to_string()))
                    })
                })
                .collect();

            if upgrades.is_empty() {
                break;
            }
            for (entity, via) in upgrades {
                tracing::debug!(
                    entity = %entity,
                    via = %via,
                    "Raising cache isolation to protected"
                );
                if let Some(d) = self.descriptors.get_mut(&entity) {
                    d.isolation = CacheIsolation::Protected;
                }
            }
        }
    }

    /// All columns read for `desc`, embedded columns flattened in mapping order.
    pub fn select_columns(&self, desc: &ClassDescriptor) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(desc, &mut out);
        out
    }

    fn collect_columns(&self, desc: &ClassDescriptor, out: &mut Vec<String>) {
        for mapping in &desc.mappings {
            match mapping {
                Mapping::Direct { column, .. } => out.push(column.clone()),
                Mapping::Reference { foreign_key, .. } => out.push(foreign_key.clone()),
                Mapping::Collection { .. } => {}
                Mapping::Embedded { embeddable, .. } => {
                    if let Some(inner) = self.descriptors.get(embeddable) {
                        self.collect_columns(inner, out);
                    }
                }
            }
        }
    }

    /// Tables that `desc`'s table holds foreign keys to.
    pub fn table_dependencies(&self, desc: &ClassDescriptor) -> Vec<String> {
        let mut deps = Vec::new();
        self.collect_dependencies(desc, &mut deps);
        deps.retain(|t| t != &desc.table);
        deps.sort();
        deps.dedup();
        deps
    }

    fn collect_dependencies(&self, desc: &ClassDescriptor, out: &mut Vec<String>) {
        for mapping in &desc.mappings {
            match mapping {
                Mapping::Reference { target, .. } => {
                    if let Some(t) = self.descriptors.get(target) {
                        out.push(t.table.clone());
                    }
                }
                Mapping::Embedded { embeddable, .. } => {
                    if let Some(inner) = self.descriptors.get(embeddable) {
                        self.collect_dependencies(inner, out);
                    }
                }
                Mapping::Direct { .. } | Mapping::Collection { .. } => {}
            }
        }
    }
}
