//! The persistence context consumed by a REST layer.
//!
//! Every operation of [`PersistenceContext`] runs in exactly one unit of
//! work: it commits when the operation succeeds, rolls back when it fails,
//! and releases the unit of work either way. Entities go in and come out as
//! JSON (see [`crate::json`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use persist::PersistenceContext;
//! use serde_json::json;
//!
//! let ctx = PersistenceContext::new(server);
//! let created = ctx.create(None, "Employee", &json!({"name": "Ada"}))?;
//! let found = ctx.find(None, "Employee", &created["id"], &HashMap::new())?;
//! ```

use crate::json::{attribute_from_json, entity_from_json, entity_to_json, key_from_json};
use persist_core::sync;
use persist_core::{
    AttributeValue, ClassDescriptor, EntityRef, Error, Mapping, Project, Result, Value,
    ValueHolder,
};
use persist_query::{DatabaseQuery, QueryResult, TranslationRow, apply_hints};
use persist_session::config::TENANT_PREFIX;
use persist_session::{ServerSession, UnitOfWork};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Property carrying the tenant id into each unit of work.
pub const TENANT_ID: &str = "persist.tenant.id";

/// Result of [`PersistenceContext::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    /// A single result, `null` when nothing matched.
    Single(Json),
    List(Vec<Json>),
    /// Rows affected by an update or delete query.
    Updated { updated: u64 },
}

/// Entity-level operations over one server session.
pub struct PersistenceContext {
    server: Arc<ServerSession>,
    tenants: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl PersistenceContext {
    pub fn new(server: ServerSession) -> Self {
        Self::from_arc(Arc::new(server))
    }

    pub fn from_arc(server: Arc<ServerSession>) -> Self {
        Self {
            server,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &ServerSession {
        &self.server
    }

    fn project(&self) -> &Project {
        self.server.project_arc()
    }

    /// Register the discriminator properties of `tenant_id`. Keys without
    /// the tenant prefix are prefixed.
    pub fn register_tenant(&self, tenant_id: impl Into<String>, properties: HashMap<String, String>) {
        let properties = properties
            .into_iter()
            .map(|(k, v)| {
                if k.starts_with(TENANT_PREFIX) {
                    (k, v)
                } else {
                    (format!("{TENANT_PREFIX}{k}"), v)
                }
            })
            .collect();
        sync::write(&self.tenants).insert(tenant_id.into(), properties);
    }

    /// Properties handed to a unit of work acquired for `tenant_id`.
    pub fn tenant_properties(&self, tenant_id: Option<&str>) -> HashMap<String, String> {
        let Some(tenant_id) = tenant_id else {
            return HashMap::new();
        };
        let mut properties = sync::read(&self.tenants)
            .get(tenant_id)
            .cloned()
            .unwrap_or_default();
        properties.insert(TENANT_ID.to_string(), tenant_id.to_string());
        properties
    }

    /// Run `work` in a fresh unit of work, committing on success.
    fn transact<T>(
        &self,
        tenant_id: Option<&str>,
        operation: &'static str,
        work: impl FnOnce(&UnitOfWork<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut uow = self
            .server
            .acquire_unit_of_work(self.tenant_properties(tenant_id));
        let outcome = work(&uow).and_then(|value| uow.commit().map(|_| value));
        if let Err(e) = &outcome {
            tracing::debug!(
                operation,
                tenant = ?tenant_id,
                error = %e,
                retryable = e.is_retryable(),
                "Operation failed"
            );
            uow.rollback();
        }
        uow.release();
        outcome
    }

    fn render(&self, object: &EntityRef) -> Json {
        entity_to_json(self.project(), &sync::read(object))
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    /// Read one entity by key. `hints` apply to the read.
    #[tracing::instrument(level = "debug", skip(self, id, hints))]
    pub fn find(
        &self,
        tenant_id: Option<&str>,
        entity: &str,
        id: &Json,
        hints: &HashMap<String, String>,
    ) -> Result<Option<Json>> {
        let key = key_from_json(self.project().require(entity)?, id)?;
        let found = self.transact(tenant_id, "find", |uow| {
            uow.find_with_hints(entity, &key, hints)
        })?;
        Ok(found.map(|object| self.render(&object)))
    }

    /// Persist a new entity and return it with its assigned key.
    #[tracing::instrument(level = "debug", skip(self, json))]
    pub fn create(&self, tenant_id: Option<&str>, entity: &str, json: &Json) -> Result<Json> {
        let new = entity_from_json(self.project(), entity, json)?;
        let object = self.transact(tenant_id, "create", |uow| uow.register_new_object(new))?;
        Ok(self.render(&object))
    }

    /// Copy `json` onto the stored entity of the same key, inserting it when
    /// no such entity exists.
    #[tracing::instrument(level = "debug", skip(self, json))]
    pub fn merge(&self, tenant_id: Option<&str>, entity: &str, json: &Json) -> Result<Json> {
        let detached = entity_from_json(self.project(), entity, json)?;
        let object = self.transact(tenant_id, "merge", |uow| uow.merge(detached))?;
        Ok(self.render(&object))
    }

    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn delete(&self, tenant_id: Option<&str>, entity: &str, id: &Json) -> Result<()> {
        let key = key_from_json(self.project().require(entity)?, id)?;
        self.transact(tenant_id, "delete", |uow| {
            let object = require_object(uow, entity, &key)?;
            uow.delete_object(&object)
        })
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    /// The value of one attribute: a value, an embedded object, the
    /// referenced entity or the collection's entities.
    #[tracing::instrument(level = "debug", skip(self, id, hints))]
    pub fn find_attribute(
        &self,
        tenant_id: Option<&str>,
        entity: &str,
        id: &Json,
        attribute: &str,
        hints: &HashMap<String, String>,
    ) -> Result<Json> {
        let desc = self.project().require(entity)?;
        let key = key_from_json(desc, id)?;
        let mapping = require_mapping(desc, attribute)?.clone();
        let read = self.transact(tenant_id, "find_attribute", |uow| {
            let owner = uow
                .find_with_hints(entity, &key, hints)?
                .ok_or_else(|| missing(entity, &key))?;
            match &mapping {
                Mapping::Direct { .. } | Mapping::Embedded { .. } => {
                    Ok(AttributeRead::Value(attribute_json(self.project(), &owner, attribute)))
                }
                Mapping::Reference { .. } => {
                    Ok(AttributeRead::Object(uow.load_reference(&owner, attribute)?))
                }
                Mapping::Collection { .. } => {
                    Ok(AttributeRead::Objects(uow.load_collection(&owner, attribute)?))
                }
            }
        })?;
        Ok(match read {
            AttributeRead::Value(json) => json,
            AttributeRead::Object(object) => object.map_or(Json::Null, |o| self.render(&o)),
            AttributeRead::Objects(items) => {
                Json::Array(items.iter().map(|o| self.render(o)).collect())
            }
        })
    }

    /// Set a basic, embedded or reference attribute, or add an entity to a
    /// collection. Returns the owner.
    ///
    /// `value` is the new value; for relationships it is either the target's
    /// key or a target object, merged before it is linked. `partner` names
    /// the attribute of the target pointing back at the owner, which is kept
    /// in step. For a collection it must be the collection's `mapped_by`
    /// attribute, which is always set.
    #[tracing::instrument(level = "debug", skip(self, id, value))]
    pub fn update_or_add_attribute(
        &self,
        tenant_id: Option<&str>,
        entity: &str,
        id: &Json,
        attribute: &str,
        value: &Json,
        partner: Option<&str>,
    ) -> Result<Json> {
        let desc = self.project().require(entity)?;
        let key = key_from_json(desc, id)?;
        let mapping = require_mapping(desc, attribute)?.clone();
        if let (Mapping::Collection { mapped_by, .. }, Some(partner)) = (&mapping, partner) {
            if partner != mapped_by {
                return Err(Error::illegal_argument(format!(
                    "partner of '{entity}.{attribute}' is '{mapped_by}', not '{partner}'"
                )));
            }
        }
        let owner = self.transact(tenant_id, "update_or_add_attribute", |uow| {
            let owner = require_object(uow, entity, &key)?;
            match &mapping {
                Mapping::Direct { .. } | Mapping::Embedded { .. } => {
                    let decoded = attribute_from_json(self.project(), &mapping, value)?;
                    sync::write(&owner).set_attribute(attribute, decoded);
                }
                Mapping::Reference { target, .. } => {
                    let linked = self.resolve_target(uow, target, value)?;
                    let target_key = single_key(self.project(), &linked)?;
                    sync::write(&owner).set_reference(attribute, target_key, EntityRef::clone(&linked));
                    if let Some(partner) = partner {
                        let owner_key = single_key(self.project(), &owner)?;
                        self.link_partner(&linked, partner, entity, &owner, owner_key)?;
                    }
                }
                Mapping::Collection {
                    target, mapped_by, ..
                } => {
                    let member = self.resolve_target(uow, target, value)?;
                    let owner_key = single_key(self.project(), &owner)?;
                    sync::write(&member).set_reference(
                        mapped_by.as_str(),
                        owner_key,
                        EntityRef::clone(&owner),
                    );
                    let mut o = sync::write(&owner);
                    if let Some(holder) = o.collection_mut(attribute) {
                        if let Some(items) = holder.items() {
                            if !items.iter().any(|i| Arc::ptr_eq(i, &member)) {
                                let mut items = items.to_vec();
                                items.push(member);
                                holder.set_items(items);
                            }
                        }
                    }
                }
            }
            Ok(owner)
        })?;
        Ok(self.render(&owner))
    }

    /// Clear a basic, embedded or reference attribute, or remove the entity
    /// keyed `target_id` from a collection. Returns the owner.
    ///
    /// `partner` has the meaning it has for
    /// [`update_or_add_attribute`](Self::update_or_add_attribute).
    #[tracing::instrument(level = "debug", skip(self, id, target_id))]
    pub fn remove_attribute(
        &self,
        tenant_id: Option<&str>,
        entity: &str,
        id: &Json,
        attribute: &str,
        target_id: Option<&Json>,
        partner: Option<&str>,
    ) -> Result<Json> {
        let desc = self.project().require(entity)?;
        let key = key_from_json(desc, id)?;
        let mapping = require_mapping(desc, attribute)?.clone();
        let owner = self.transact(tenant_id, "remove_attribute", |uow| {
            let owner = require_object(uow, entity, &key)?;
            match &mapping {
                Mapping::Direct { .. } => sync::write(&owner).set(attribute, Value::Null),
                Mapping::Embedded { .. } => {
                    sync::write(&owner).set_attribute(attribute, AttributeValue::Embedded(None));
                }
                Mapping::Reference { .. } => {
                    if let Some(partner) = partner {
                        if let Some(linked) = uow.load_reference(&owner, attribute)? {
                            unlink_partner(&linked, partner, &owner);
                        }
                    }
                    sync::write(&owner).set_reference_key(attribute, Value::Null);
                }
                Mapping::Collection {
                    target, mapped_by, ..
                } => {
                    let target_id = target_id.ok_or_else(|| {
                        Error::illegal_argument(format!(
                            "removing from '{entity}.{attribute}' needs the member's key"
                        ))
                    })?;
                    let target_key = key_from_json(self.project().require(target)?, target_id)?;
                    let member = require_object(uow, target, &target_key)?;
                    let owner_key = single_key(self.project(), &owner)?;
                    let belongs = sync::read(&member)
                        .reference(mapped_by)
                        .and_then(|h| h.key())
                        .is_some_and(|k| k.normalized() == owner_key);
                    if !belongs {
                        return Err(Error::illegal_argument(format!(
                            "{target} {target_id} is not in '{entity}.{attribute}'"
                        )));
                    }
                    sync::write(&member).set_reference_key(mapped_by.as_str(), Value::Null);
                    let mut o = sync::write(&owner);
                    if let Some(holder) = o.collection_mut(attribute) {
                        if let Some(items) = holder.items() {
                            let kept = items
                                .iter()
                                .filter(|i| !Arc::ptr_eq(i, &member))
                                .cloned()
                                .collect();
                            holder.set_items(kept);
                        }
                    }
                }
            }
            Ok(owner)
        })?;
        Ok(self.render(&owner))
    }

    /// The working copy of the target given by `value`: merged when it is an
    /// object, looked up when it is a key.
    fn resolve_target(&self, uow: &UnitOfWork<'_>, target: &str, value: &Json) -> Result<EntityRef> {
        if value.is_object() {
            return uow.merge(entity_from_json(self.project(), target, value)?);
        }
        let key = key_from_json(self.project().require(target)?, value)?;
        require_object(uow, target, &key)
    }

    /// Point `partner` of `linked` back at `owner`.
    fn link_partner(
        &self,
        linked: &EntityRef,
        partner: &str,
        owner_entity: &str,
        owner: &EntityRef,
        owner_key: Value,
    ) -> Result<()> {
        let target_entity = sync::read(linked).entity_name().to_string();
        let desc = self.project().require(&target_entity)?;
        match desc.mapping(partner) {
            Some(Mapping::Reference { target, .. }) if target == owner_entity => {
                sync::write(linked).set_reference(partner, owner_key, EntityRef::clone(owner));
                Ok(())
            }
            Some(Mapping::Collection { target, .. }) if target == owner_entity => {
                let mut l = sync::write(linked);
                if let Some(holder) = l.collection_mut(partner) {
                    if let Some(items) = holder.items() {
                        if !items.iter().any(|i| Arc::ptr_eq(i, owner)) {
                            let mut items = items.to_vec();
                            items.push(EntityRef::clone(owner));
                            holder.set_items(items);
                        }
                    }
                }
                Ok(())
            }
            _ => Err(Error::illegal_argument(format!(
                "'{target_entity}.{partner}' does not refer back to '{owner_entity}'"
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Named queries
    // ------------------------------------------------------------------------

    /// Execute the named query `name`.
    ///
    /// `params` bind the query's arguments by name. With `execute_update` the
    /// query must modify and the outcome is the row count; otherwise it must
    /// read. `single_result` asks for at most one result.
    #[tracing::instrument(level = "debug", skip(self, params, hints))]
    pub fn query(
        &self,
        tenant_id: Option<&str>,
        name: &str,
        params: &HashMap<String, Json>,
        hints: &HashMap<String, String>,
        single_result: bool,
        execute_update: bool,
    ) -> Result<QueryOutcome> {
        let registered = self.server.named_query(name)?;
        let query = if hints.is_empty() {
            registered
        } else {
            let mut hinted = DatabaseQuery::clone(&registered);
            apply_hints(&mut hinted, hints)?;
            Arc::new(hinted)
        };
        let modifies = query.kind().is_modify_query();
        if modifies != execute_update {
            return Err(Error::illegal_state(if modifies {
                format!("query '{name}' modifies data and must be run as an update")
            } else {
                format!("query '{name}' reads data and cannot be run as an update")
            }));
        }
        let row = translation_row(&query, params)?;
        let result = self.transact(tenant_id, "query", |uow| uow.execute_with_row(&query, &row))?;

        let results: Vec<Json> = match result {
            QueryResult::RowCount(updated) => return Ok(QueryOutcome::Updated { updated }),
            QueryResult::Object(object) => object.iter().map(|o| self.render(o)).collect(),
            QueryResult::Objects(objects) => objects.iter().map(|o| self.render(o)).collect(),
            QueryResult::Rows(rows) => rows
                .iter()
                .map(|row| {
                    Json::Object(
                        row.iter()
                            .map(|(column, value)| (column.to_string(), value.to_json()))
                            .collect(),
                    )
                })
                .collect(),
        };
        if !single_result {
            return Ok(QueryOutcome::List(results));
        }
        if results.len() > 1 {
            return Err(Error::illegal_state(format!(
                "query '{name}' returned {} results where one was expected",
                results.len()
            )));
        }
        Ok(QueryOutcome::Single(
            results.into_iter().next().unwrap_or(Json::Null),
        ))
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("tenants", &sync::read(&self.tenants).len())
            .finish_non_exhaustive()
    }
}

enum AttributeRead {
    Value(Json),
    Object(Option<EntityRef>),
    Objects(Vec<EntityRef>),
}

fn require_mapping<'d>(desc: &'d ClassDescriptor, attribute: &str) -> Result<&'d Mapping> {
    desc.mapping(attribute).ok_or_else(|| {
        Error::illegal_argument(format!(
            "'{}' has no attribute '{attribute}'",
            desc.entity_name()
        ))
    })
}

fn missing(entity: &str, key: &[Value]) -> Error {
    let key: Vec<String> = key.iter().map(ToString::to_string).collect();
    Error::not_found(format!("no {entity} with key [{}]", key.join(", ")))
}

fn require_object(uow: &UnitOfWork<'_>, entity: &str, key: &[Value]) -> Result<EntityRef> {
    uow.find(entity, key)?.ok_or_else(|| missing(entity, key))
}

/// The single key value of `object`, `Null` while it is still unassigned.
fn single_key(project: &Project, object: &EntityRef) -> Result<Value> {
    let entity = sync::read(object);
    let desc = project.require(entity.entity_name())?;
    if desc.primary_key().len() != 1 {
        return Err(Error::illegal_argument(format!(
            "'{}' must have a single-attribute key to be related",
            desc.entity_name()
        )));
    }
    Ok(entity
        .primary_key(desc)
        .and_then(|pk| pk.values().first().cloned())
        .unwrap_or(Value::Null))
}

fn attribute_json(project: &Project, owner: &EntityRef, attribute: &str) -> Json {
    let owner = sync::read(owner);
    match owner.get(attribute) {
        Some(AttributeValue::Basic(v)) => v.to_json(),
        Some(AttributeValue::Embedded(Some(inner))) => entity_to_json(project, inner),
        _ => Json::Null,
    }
}

/// Undo what [`PersistenceContext::link_partner`] did, where possible.
fn unlink_partner(linked: &EntityRef, partner: &str, owner: &EntityRef) {
    let mut l = sync::write(linked);
    match l.get_mut(partner) {
        Some(AttributeValue::Reference(holder))
            if holder.value().is_none_or(|v| Arc::ptr_eq(v, owner)) =>
        {
            *holder = ValueHolder::from_key(Value::Null);
        }
        Some(AttributeValue::Collection(holder)) => {
            if let Some(items) = holder.items() {
                let kept = items
                    .iter()
                    .filter(|i| !Arc::ptr_eq(i, owner))
                    .cloned()
                    .collect();
                holder.set_items(kept);
            }
        }
        _ => {}
    }
}

/// Bind `params` to the arguments of `query`, converting each to the
/// argument's declared type.
fn translation_row(query: &DatabaseQuery, params: &HashMap<String, Json>) -> Result<TranslationRow> {
    if let Some(unknown) = params
        .keys()
        .find(|name| !query.arguments().iter().any(|a| &a.name == *name))
    {
        return Err(Error::illegal_argument(format!(
            "query '{}' has no parameter '{unknown}'",
            query.display_name()
        )));
    }
    let mut row = TranslationRow::new();
    for argument in query.arguments() {
        let json = params.get(&argument.name).ok_or_else(|| {
            Error::illegal_argument(format!(
                "no value for parameter '{}' of query '{}'",
                argument.name,
                query.display_name()
            ))
        })?;
        let value = match argument.attribute_type {
            Some(ty) => ty.from_json(json)?,
            None => Value::from_json(json),
        };
        row.insert(argument.name.clone(), value);
    }
    Ok(row)
}
