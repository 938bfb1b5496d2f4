//! Dynamic entity instances.
//!
//! An [`Entity`] is an attribute map interpreted through its
//! [`ClassDescriptor`]. Single-valued relationships are held in a
//! [`ValueHolder`] carrying the raw foreign key and, once resolved, the target
//! instance; collections are held in a [`CollectionHolder`]. Both start
//! unresolved when built from a row.

use crate::descriptor::{ClassDescriptor, Mapping, Project};
use crate::error::{Error, Result, TypeError};
use crate::row::Row;
use crate::value::Value;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// Shared handle to an entity instance.
///
/// Two handles are the same object exactly when `Arc::ptr_eq` holds.
pub type EntityRef = Arc<RwLock<Entity>>;

/// Wrap an entity in a fresh shared handle.
pub fn entity_ref(entity: Entity) -> EntityRef {
    Arc::new(RwLock::new(entity))
}

// ============================================================================
// Primary keys
// ============================================================================

/// A (possibly composite) primary key with integer widths normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.iter().map(Value::normalized).collect())
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self::new(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// A key with a NULL component identifies nothing.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(Value::is_null)
    }

    /// Stable 64-bit digest, used in log fields.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl Eq for PrimaryKey {}

impl Hash for PrimaryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

/// Key values separated by commas, each formatted as a SQL literal, so a
/// text key prints quoted: `1,'x'`.
impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

// ============================================================================
// Relationship holders
// ============================================================================

/// Indirection for a single-valued relationship.
#[derive(Clone, Default)]
pub struct ValueHolder {
    key: Option<Value>,
    value: Option<EntityRef>,
}

impl ValueHolder {
    /// Unresolved holder for foreign key `key`. A NULL key means "no target".
    pub fn from_key(key: Value) -> Self {
        let key = (!key.is_null()).then(|| key.normalized());
        Self { key, value: None }
    }

    /// Resolved holder.
    pub fn resolved(key: Value, target: EntityRef) -> Self {
        Self {
            key: (!key.is_null()).then(|| key.normalized()),
            value: Some(target),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&EntityRef> {
        self.value.as_ref()
    }

    /// True once the target has been fetched, or when there is no target.
    pub fn is_instantiated(&self) -> bool {
        self.value.is_some() || self.key.is_none()
    }

    pub fn set_value(&mut self, target: Option<EntityRef>) {
        self.value = target;
    }

    /// Drop the resolved target, keeping only the foreign key.
    pub fn unresolve(&mut self) {
        self.value = None;
    }
}

impl fmt::Debug for ValueHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHolder")
            .field("key", &self.key)
            .field("instantiated", &self.value.is_some())
            .finish()
    }
}

/// Indirection for a one-to-many collection.
#[derive(Clone, Default)]
pub struct CollectionHolder {
    items: Option<Vec<EntityRef>>,
}

impl CollectionHolder {
    pub fn unfetched() -> Self {
        Self { items: None }
    }

    pub fn fetched(items: Vec<EntityRef>) -> Self {
        Self { items: Some(items) }
    }

    pub fn items(&self) -> Option<&[EntityRef]> {
        self.items.as_deref()
    }

    pub fn is_instantiated(&self) -> bool {
        self.items.is_some()
    }

    pub fn set_items(&mut self, items: Vec<EntityRef>) {
        self.items = Some(items);
    }

    pub fn unresolve(&mut self) {
        self.items = None;
    }
}

impl fmt::Debug for CollectionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.items {
            Some(items) => write!(f, "CollectionHolder({} items)", items.len()),
            None => f.write_str("CollectionHolder(unfetched)"),
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

/// State of one attribute.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Basic(Value),
    Reference(ValueHolder),
    Collection(CollectionHolder),
    Embedded(Option<Box<Entity>>),
}

/// A dynamic instance of an entity or embeddable type.
#[derive(Debug, Clone)]
pub struct Entity {
    entity_name: String,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Entity {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set a basic attribute (builder style).
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }

    pub fn get_mut(&mut self, attribute: &str) -> Option<&mut AttributeValue> {
        self.attributes.get_mut(attribute)
    }

    /// Basic attribute value, if the attribute is basic and set.
    pub fn value(&self, attribute: &str) -> Option<&Value> {
        match self.attributes.get(attribute)? {
            AttributeValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes
            .insert(attribute.into(), AttributeValue::Basic(value.into().normalized()));
    }

    pub fn set_attribute(&mut self, attribute: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(attribute.into(), value);
    }

    pub fn remove(&mut self, attribute: &str) -> Option<AttributeValue> {
        self.attributes.remove(attribute)
    }

    pub fn reference(&self, attribute: &str) -> Option<&ValueHolder> {
        match self.attributes.get(attribute)? {
            AttributeValue::Reference(h) => Some(h),
            _ => None,
        }
    }

    pub fn reference_mut(&mut self, attribute: &str) -> Option<&mut ValueHolder> {
        match self.attributes.get_mut(attribute)? {
            AttributeValue::Reference(h) => Some(h),
            _ => None,
        }
    }

    pub fn collection(&self, attribute: &str) -> Option<&CollectionHolder> {
        match self.attributes.get(attribute)? {
            AttributeValue::Collection(h) => Some(h),
            _ => None,
        }
    }

    pub fn collection_mut(&mut self, attribute: &str) -> Option<&mut CollectionHolder> {
        match self.attributes.get_mut(attribute)? {
            AttributeValue::Collection(h) => Some(h),
            _ => None,
        }
    }

    pub fn embedded(&self, attribute: &str) -> Option<&Entity> {
        match self.attributes.get(attribute)? {
            AttributeValue::Embedded(e) => e.as_deref(),
            _ => None,
        }
    }

    /// Point reference `attribute` at `target`, whose key is `key`.
    pub fn set_reference(&mut self, attribute: impl Into<String>, key: Value, target: EntityRef) {
        self.attributes.insert(
            attribute.into(),
            AttributeValue::Reference(ValueHolder::resolved(key, target)),
        );
    }

    /// Point reference `attribute` at the row with foreign key `key`, unresolved.
    pub fn set_reference_key(&mut self, attribute: impl Into<String>, key: Value) {
        self.attributes.insert(
            attribute.into(),
            AttributeValue::Reference(ValueHolder::from_key(key)),
        );
    }

    /// The primary key, or `None` when any key attribute is unset or NULL.
    pub fn primary_key(&self, desc: &ClassDescriptor) -> Option<PrimaryKey> {
        let values = desc
            .primary_key()
            .iter()
            .map(|attr| self.value(attr).cloned())
            .collect::<Option<Vec<_>>>()?;
        let key = PrimaryKey::new(values);
        (!key.is_null()).then_some(key)
    }

    /// Copy with every relationship reduced to its foreign key.
    ///
    /// The copy shares no handles with `self`.
    pub fn detached_copy(&self) -> Entity {
        let attributes = self
            .attributes
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    AttributeValue::Basic(v) => AttributeValue::Basic(v.clone()),
                    AttributeValue::Reference(h) => AttributeValue::Reference(ValueHolder {
                        key: h.key.clone(),
                        value: None,
                    }),
                    AttributeValue::Collection(_) => {
                        AttributeValue::Collection(CollectionHolder::unfetched())
                    }
                    AttributeValue::Embedded(e) => {
                        AttributeValue::Embedded(e.as_ref().map(|e| Box::new(e.detached_copy())))
                    }
                };
                (name.clone(), value)
            })
            .collect();
        Entity {
            entity_name: self.entity_name.clone(),
            attributes,
        }
    }

    /// Replace this instance's state with `other`'s, keeping the handle.
    pub fn refresh_from(&mut self, other: Entity) {
        self.attributes = other.attributes;
    }

    // ------------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------------

    /// Build an instance from a result row, relationships unresolved.
    pub fn from_row(project: &Project, desc: &ClassDescriptor, row: &Row) -> Result<Entity> {
        let mut entity = Entity::new(desc.entity_name());
        for mapping in desc.mappings() {
            let value = match mapping {
                Mapping::Direct {
                    column,
                    attribute_type,
                    ..
                } => AttributeValue::Basic(attribute_type.from_column(column_value(row, column)?)),
                Mapping::Reference { foreign_key, .. } => {
                    AttributeValue::Reference(ValueHolder::from_key(column_value(row, foreign_key)?))
                }
                Mapping::Collection { .. } => {
                    AttributeValue::Collection(CollectionHolder::unfetched())
                }
                Mapping::Embedded { embeddable, .. } => {
                    let inner_desc = project.require(embeddable)?;
                    let inner = Entity::from_row(project, inner_desc, row)?;
                    let all_null = inner.attributes.values().all(|v| match v {
                        AttributeValue::Basic(v) => v.is_null(),
                        AttributeValue::Reference(h) => h.key.is_none(),
                        AttributeValue::Embedded(e) => e.is_none(),
                        AttributeValue::Collection(_) => true,
                    });
                    AttributeValue::Embedded((!all_null).then(|| Box::new(inner)))
                }
            };
            entity.attributes.insert(mapping.attribute().to_string(), value);
        }
        Ok(entity)
    }

    /// Column/value pairs for INSERT and UPDATE, embedded columns flattened.
    pub fn column_values(&self, project: &Project, desc: &ClassDescriptor) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        self.collect_column_values(project, desc, &mut out);
        out
    }

    fn collect_column_values(
        &self,
        project: &Project,
        desc: &ClassDescriptor,
        out: &mut Vec<(String, Value)>,
    ) {
        for mapping in desc.mappings() {
            match mapping {
                Mapping::Direct {
                    attribute, column, ..
                } => {
                    let v = self.value(attribute).cloned().unwrap_or(Value::Null);
                    out.push((column.clone(), v));
                }
                Mapping::Reference {
                    attribute,
                    foreign_key,
                    ..
                } => {
                    let v = self
                        .reference(attribute)
                        .and_then(ValueHolder::key)
                        .cloned()
                        .unwrap_or(Value::Null);
                    out.push((foreign_key.clone(), v));
                }
                Mapping::Collection { .. } => {}
                Mapping::Embedded {
                    attribute,
                    embeddable,
                } => {
                    let Some(inner_desc) = project.descriptor(embeddable) else {
                        continue;
                    };
                    match self.embedded(attribute) {
                        Some(inner) => inner.collect_column_values(project, inner_desc, out),
                        None => out.extend(
                            project
                                .select_columns(inner_desc)
                                .into_iter()
                                .map(|c| (c, Value::Null)),
                        ),
                    }
                }
            }
        }
    }
}

fn column_value(row: &Row, column: &str) -> Result<Value> {
    row.get_by_name(column).cloned().ok_or_else(|| {
        Error::Type(TypeError {
            expected: "mapped column",
            actual: "missing from result set".to_string(),
            column: Some(column.to_string()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AttributeType;
    use std::collections::HashSet;

    fn project() -> Project {
        let mut p = Project::new()
            .with(
                ClassDescriptor::entity("Employee", "EMPLOYEE")
                    .id("id", "EMP_ID", AttributeType::Integer)
                    .direct("name", "NAME", AttributeType::Text)
                    .many_to_one("manager", "Employee", "MGR_ID")
                    .embedded("period", "Period"),
            )
            .with(
                ClassDescriptor::embeddable("Period")
                    .direct("start", "START_YEAR", AttributeType::Integer),
            );
        p.initialize().unwrap();
        p
    }

    #[test]
    fn primary_keys_normalize_integer_widths() {
        let a = PrimaryKey::single(Value::Int(7));
        let b = PrimaryKey::single(7_i64);
        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(PrimaryKey::single(Value::Null).is_null());
        assert_eq!(
            PrimaryKey::new(vec![Value::BigInt(1), Value::Text("x".into())]).to_string(),
            "1,'x'"
        );
        // Text keys stay distinguishable from numeric ones.
        assert_ne!(
            PrimaryKey::single(Value::Text("1".into())).to_string(),
            PrimaryKey::single(1_i64).to_string()
        );
    }

    #[test]
    fn from_row_builds_unresolved_references() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let row = Row::new(
            vec![
                "EMP_ID".into(),
                "NAME".into(),
                "MGR_ID".into(),
                "START_YEAR".into(),
            ],
            vec![
                Value::Int(2),
                Value::Text("Bob".into()),
                Value::Int(1),
                Value::Int(2020),
            ],
        );
        let e = Entity::from_row(&p, desc, &row).unwrap();
        assert_eq!(e.value("id"), Some(&Value::BigInt(2)));
        let holder = e.reference("manager").unwrap();
        assert_eq!(holder.key(), Some(&Value::BigInt(1)));
        assert!(!holder.is_instantiated());
        assert_eq!(
            e.embedded("period").unwrap().value("start"),
            Some(&Value::BigInt(2020))
        );
        assert_eq!(e.primary_key(desc), Some(PrimaryKey::single(2_i64)));

        let cols = e.column_values(&p, desc);
        assert_eq!(
            cols.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
            vec!["EMP_ID", "NAME", "MGR_ID", "START_YEAR"]
        );
    }

    #[test]
    fn from_row_reports_missing_columns() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        let row = Row::new(vec!["EMP_ID".into()], vec![Value::Int(1)]);
        assert!(matches!(
            Entity::from_row(&p, desc, &row),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn detached_copy_drops_resolved_targets() {
        let target = entity_ref(Entity::new("Employee").with("id", 1_i64));
        let mut e = Entity::new("Employee").with("id", 2_i64);
        e.set_reference("manager", Value::BigInt(1), Arc::clone(&target));
        e.set_attribute(
            "reports",
            AttributeValue::Collection(CollectionHolder::fetched(vec![target])),
        );

        let copy = e.detached_copy();
        let holder = copy.reference("manager").unwrap();
        assert_eq!(holder.key(), Some(&Value::BigInt(1)));
        assert!(holder.value().is_none());
        assert!(!copy.collection("reports").unwrap().is_instantiated());
    }

    #[test]
    fn primary_key_requires_every_component() {
        let p = project();
        let desc = p.require("Employee").unwrap();
        assert_eq!(Entity::new("Employee").primary_key(desc), None);
        assert_eq!(
            Entity::new("Employee")
                .with("id", Value::Null)
                .primary_key(desc),
            None
        );
    }
}
