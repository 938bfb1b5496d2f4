//! The unit of work: one client's transactional working set.
//!
//! # Overview
//!
//! Every object a unit of work reads is registered as a private working
//! copy. Shared-cache instances are never handed out; a copy is taken and
//! its protected foreign keys restored. Changes stay in the working copies
//! until [`UnitOfWork::flush`] writes them, and reach the shared cache only
//! when [`UnitOfWork::commit`] succeeds.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = server.acquire_unit_of_work(HashMap::new());
//!
//! let dept = uow.register_new_object(Entity::new("Department").with("name", "R&D"))?;
//! if let Some(emp) = uow.find("Employee", &[Value::BigInt(7)])? {
//!     sync::write(&emp).set("salary", 5200i64);
//! }
//!
//! let stats = uow.commit()?;
//! ```
//!
//! # Transactions
//!
//! A database transaction is opened on the first flush (or by
//! [`UnitOfWork::begin_early_transaction`]) and holds the server's
//! transaction gate until commit or rollback, so writers are serialized on
//! the shared connection. Once a transaction is open, reads skip the shared
//! cache: they must see this unit's own uncommitted writes.

use crate::ObjectKey;
use crate::change_tracker::ChangeTracker;
use crate::config;
use crate::execution::{
    RawResult, build_objects, check_shared_cache, conforming, object_result, run_call,
};
use crate::flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp, sync_reference_keys};
use crate::merge::{CommitSet, MergeStats, merge_commit, restore_protected};
use crate::object_builder::Built;
use crate::server::ServerSession;
use persist_core::sync;
use persist_core::{
    AttributeValue, ClassDescriptor, Dialect, Entity, EntityRef, Error, Mapping, Project,
    QueryTimeout, Result, TransactionError, TransactionErrorKind, Value, entity_ref,
};
use persist_query::{
    CacheRetrieveMode, CacheStoreMode, CacheUsage, ConformContext, DatabaseQuery, EarlyReturn,
    FlushMode, PreparedCall, QueryKind, QueryProfiler, QueryResult, QuerySession,
    TranslationRow, apply_hints, hints,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, MutexGuard};

/// Where an object stands relative to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Registered new; inserted at the next flush.
    New,
    /// A working copy owned by this unit of work.
    Managed,
    /// Registered for deletion.
    Deleted,
    /// Not known to this unit of work.
    Detached,
}

/// Counts of pending work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Committed,
    RolledBack,
    Released,
}

#[derive(Debug, Default)]
struct WorkingSet {
    registered: HashMap<ObjectKey, EntityRef>,
    tracker: ChangeTracker,
    new_objects: Vec<EntityRef>,
    deleted: HashMap<ObjectKey, EntityRef>,
    flushed_deletes: HashSet<ObjectKey>,
    /// Keys inserted or updated by a flush, merged into the cache at commit.
    written: HashSet<ObjectKey>,
    /// Types touched by bulk updates or deletes.
    invalidated: BTreeSet<String>,
}

/// Restores the conforming flag when a conforming read finishes.
struct ConformingMarker<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ConformingMarker<'a> {
    fn set(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for ConformingMarker<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// One client's transactional working set over a [`ServerSession`].
///
/// Not `Sync`: a unit of work belongs to the thread that acquired it.
pub struct UnitOfWork<'s> {
    server: &'s ServerSession,
    properties: HashMap<String, String>,
    flush_mode: FlushMode,
    retrieve_mode: CacheRetrieveMode,
    store_mode: CacheStoreMode,
    set: RefCell<WorkingSet>,
    conforming: Cell<bool>,
    transaction: RefCell<Option<MutexGuard<'s, ()>>>,
    lifecycle: Cell<Lifecycle>,
}

impl<'s> UnitOfWork<'s> {
    pub(crate) fn new(server: &'s ServerSession, properties: HashMap<String, String>) -> Self {
        let defaults = server.config();
        let property = |keys: &[&str]| keys.iter().find_map(|k| properties.get(*k));
        let flush_mode = property(&[config::FLUSH_MODE])
            .and_then(|v| FlushMode::parse(v))
            .unwrap_or(defaults.flush_mode);
        let retrieve_mode = property(&[hints::CACHE_RETRIEVE_MODE, hints::JAKARTA_CACHE_RETRIEVE_MODE])
            .and_then(|v| CacheRetrieveMode::parse(v))
            .unwrap_or(defaults.retrieve_mode);
        let store_mode = property(&[hints::CACHE_STORE_MODE, hints::JAKARTA_CACHE_STORE_MODE])
            .and_then(|v| CacheStoreMode::parse(v))
            .unwrap_or(defaults.store_mode);
        tracing::debug!(
            flush_mode = ?flush_mode,
            retrieve_mode = %retrieve_mode,
            store_mode = %store_mode,
            properties = properties.len(),
            "Unit of work acquired"
        );
        Self {
            server,
            properties,
            flush_mode,
            retrieve_mode,
            store_mode,
            set: RefCell::new(WorkingSet::default()),
            conforming: Cell::new(false),
            transaction: RefCell::new(None),
            lifecycle: Cell::new(Lifecycle::Active),
        }
    }

    pub fn server(&self) -> &'s ServerSession {
        self.server
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Active
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.borrow().is_some()
    }

    /// Whether a conforming read is running on this unit of work.
    pub fn is_conforming(&self) -> bool {
        self.conforming.get()
    }

    fn check_active(&self) -> Result<()> {
        match self.lifecycle.get() {
            Lifecycle::Active => Ok(()),
            state => Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Closed,
                message: format!("unit of work is {state:?}"),
            })),
        }
    }

    /// Open the database transaction now rather than at the first flush.
    ///
    /// Transactions on the server's connection are serialized: this blocks
    /// while another unit of work holds one, including one on this thread.
    pub fn begin_early_transaction(&self) -> Result<()> {
        self.check_active()?;
        let mut transaction = self.transaction.borrow_mut();
        if transaction.is_some() {
            return Ok(());
        }
        let gate = sync::lock(&self.server.transaction_gate);
        self.server.connection().begin()?;
        *transaction = Some(gate);
        tracing::debug!("Unit of work transaction started");
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        if self.transaction.borrow().is_none() {
            return Ok(());
        }
        self.server.connection().commit()?;
        self.transaction.borrow_mut().take();
        Ok(())
    }

    fn rollback_transaction(&self) {
        if let Some(gate) = self.transaction.borrow_mut().take() {
            if let Err(e) = self.server.connection().rollback() {
                tracing::warn!(error = %e, "Rollback failed");
            }
            drop(gate);
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Where `object` stands relative to this unit of work.
    pub fn state_of(&self, object: &EntityRef) -> ObjectState {
        let set = self.set.borrow();
        if set.new_objects.iter().any(|o| Arc::ptr_eq(o, object)) {
            ObjectState::New
        } else if set.deleted.values().any(|o| Arc::ptr_eq(o, object)) {
            ObjectState::Deleted
        } else if set.registered.values().any(|o| Arc::ptr_eq(o, object)) {
            ObjectState::Managed
        } else {
            ObjectState::Detached
        }
    }

    pub fn contains(&self, object: &EntityRef) -> bool {
        matches!(
            self.state_of(object),
            ObjectState::New | ObjectState::Managed
        )
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let project = self.server.project_arc();
        let set = self.set.borrow();
        let dirty = set
            .registered
            .iter()
            .filter(|(key, _)| !set.deleted.contains_key(*key))
            .filter(|(key, object)| {
                project.descriptor(key.entity()).is_some_and(|desc| {
                    set.tracker
                        .is_dirty(key, &sync::read(object), project, desc)
                })
            })
            .count();
        PendingCounts {
            new: set.new_objects.len(),
            dirty,
            deleted: set.deleted.len() - set.flushed_deletes.len(),
        }
    }

    /// The working state of a built object: a copy of the shared instance
    /// with its protected foreign keys restored, or the detached state.
    fn working_state(&self, desc: &ClassDescriptor, key: &ObjectKey, built: &Built) -> Entity {
        let mut state = sync::read(built.object()).detached_copy();
        if let Built::Shared(_) = built {
            let fks = self
                .server
                .cache()
                .lookup(key.entity(), key.key())
                .map(|e| e.protected_foreign_keys)
                .unwrap_or_default();
            restore_protected(self.server.project_arc(), desc, &mut state, &fks);
        }
        state
    }

    /// Register a read object, returning its working copy.
    ///
    /// An already registered key keeps its working copy; `refresh`
    /// overwrites that copy with the freshly read state.
    fn register_built(&self, desc: &ClassDescriptor, built: Built, refresh: bool) -> Result<EntityRef> {
        let Some(pk) = sync::read(built.object()).primary_key(desc) else {
            return Ok(built.into_object());
        };
        let key = ObjectKey::new(desc.entity_name(), pk);
        let existing = self.set.borrow().registered.get(&key).cloned();
        if let Some(working) = existing {
            if refresh {
                let state = self.working_state(desc, &key, &built);
                sync::write(&working).refresh_from(state);
                tracing::debug!(object = %key, "Refreshed working copy");
                self.set
                    .borrow_mut()
                    .tracker
                    .snapshot(key, &sync::read(&working));
            }
            return Ok(working);
        }

        let working = match built {
            Built::Shared(_) => entity_ref(self.working_state(desc, &key, &built)),
            Built::Detached(object) => object,
        };
        tracing::trace!(object = %key, "Registered working copy");
        let mut set = self.set.borrow_mut();
        set.tracker.snapshot(key.clone(), &sync::read(&working));
        set.registered.insert(key, EntityRef::clone(&working));
        Ok(working)
    }

    /// Register a new object, inserted at the next flush.
    pub fn register_new_object(&self, entity: Entity) -> Result<EntityRef> {
        self.check_active()?;
        let desc = self.server.project_arc().require(entity.entity_name())?;
        if desc.is_embeddable() {
            return Err(Error::illegal_argument(format!(
                "'{}' is embeddable and cannot be persisted on its own",
                desc.entity_name()
            )));
        }
        if let Some(pk) = entity.primary_key(desc) {
            let key = ObjectKey::new(desc.entity_name(), pk);
            let set = self.set.borrow();
            let managed = set.registered.contains_key(&key) && !set.deleted.contains_key(&key);
            let pending = set
                .new_objects
                .iter()
                .any(|o| sync::read(o).primary_key(desc).as_ref() == Some(key.key()));
            if managed || pending {
                return Err(Error::illegal_argument(format!("{key} is already managed")));
            }
        }
        let object = entity_ref(entity);
        self.set
            .borrow_mut()
            .new_objects
            .push(EntityRef::clone(&object));
        tracing::debug!(entity = desc.entity_name(), "Registered new object");
        Ok(object)
    }

    /// Register `object` for deletion at the next flush.
    ///
    /// A new object is simply forgotten. Only objects of this unit of work
    /// can be deleted.
    pub fn delete_object(&self, object: &EntityRef) -> Result<()> {
        self.check_active()?;
        let mut set = self.set.borrow_mut();
        if let Some(pos) = set.new_objects.iter().position(|o| Arc::ptr_eq(o, object)) {
            set.new_objects.remove(pos);
            return Ok(());
        }
        let entity = sync::read(object).entity_name().to_string();
        let desc = self.server.project_arc().require(&entity)?;
        let key = sync::read(object)
            .primary_key(desc)
            .map(|k| ObjectKey::new(&entity, k));
        match key {
            Some(key) if set.registered.get(&key).is_some_and(|w| Arc::ptr_eq(w, object)) => {
                tracing::debug!(object = %key, "Registered object for deletion");
                set.deleted.insert(key, EntityRef::clone(object));
                Ok(())
            }
            _ => Err(Error::illegal_argument(format!(
                "cannot delete a '{entity}' that is not managed by this unit of work"
            ))),
        }
    }

    /// Copy the state of a detached object onto its working copy.
    ///
    /// Unknown keys are registered new. Unfetched collections of `detached`
    /// leave the working copy's collection alone.
    pub fn merge(&self, detached: Entity) -> Result<EntityRef> {
        self.check_active()?;
        let desc = self.server.project_arc().require(detached.entity_name())?;
        let Some(pk) = detached.primary_key(desc) else {
            return self.register_new_object(detached);
        };
        let Some(working) = self.find(desc.entity_name(), pk.values())? else {
            return self.register_new_object(detached);
        };
        {
            let mut target = sync::write(&working);
            for (attribute, value) in detached.attributes() {
                if let AttributeValue::Collection(c) = value {
                    if !c.is_instantiated() {
                        continue;
                    }
                }
                target.set_attribute(attribute, value.clone());
            }
        }
        tracing::debug!(entity = desc.entity_name(), key = %pk, "Merged detached state");
        Ok(working)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn execute_query(&self, query: &DatabaseQuery, args: &[Value]) -> Result<QueryResult> {
        let row = query.translate(args)?;
        self.execute_with_row(query, &row)
    }

    /// Execute `query` in this unit of work.
    ///
    /// Pending changes are flushed first when the flush mode is `Auto` and a
    /// transaction is open. Conforming reads also see unflushed changes. A
    /// database error that requires it rolls back the open transaction and
    /// closes the unit of work.
    #[tracing::instrument(level = "debug", skip_all, fields(query = %query.display_name()))]
    pub fn execute_with_row(&self, query: &DatabaseQuery, row: &TranslationRow) -> Result<QueryResult> {
        self.check_active()?;
        let kind = query.kind();
        if kind.is_modify_query() {
            self.begin_early_transaction()?;
        }
        if self.should_flush_before(query) {
            self.flush()?;
        }
        let result = if query.should_conform_results_in_unit_of_work()
            && kind.is_object_level_read_query()
        {
            self.execute_conforming(query, row)
        } else {
            query.execute_with_row(self, row)
        };
        if let Err(e) = &result {
            self.abandon_failed_transaction(e);
        }
        result
    }

    /// Roll back when a database error left the open transaction unusable.
    /// A lock timeout keeps it, so the caller may retry.
    fn abandon_failed_transaction(&self, error: &Error) {
        if !(error.is_database_error() && error.requires_rollback() && self.in_transaction()) {
            return;
        }
        tracing::warn!(error = %error, "Database error inside the transaction, rolling back");
        self.rollback_transaction();
        self.set.replace(WorkingSet::default());
        self.lifecycle.set(Lifecycle::RolledBack);
    }

    fn should_flush_before(&self, query: &DatabaseQuery) -> bool {
        query.flush_mode().unwrap_or(self.flush_mode) == FlushMode::Auto
            && self.in_transaction()
            && !self.conforming.get()
    }

    fn execute_conforming(&self, query: &DatabaseQuery, row: &TranslationRow) -> Result<QueryResult> {
        let entity = query.reference_entity().ok_or_else(|| {
            Error::illegal_state(format!(
                "conforming query '{}' has no reference entity",
                query.display_name()
            ))
        })?;
        let project = self.server.project_arc();
        let desc = project.require(entity)?;
        query.check_prepare(self, row, false)?;
        let mut clone = query.clone();
        clone.set_cache_usage(CacheUsage::UseDescriptorSetting);
        let _marker = ConformingMarker::set(&self.conforming);

        let (candidates, deleted) = {
            let set = self.set.borrow();
            let candidates: Vec<EntityRef> = set
                .registered
                .iter()
                .filter(|(key, _)| key.entity() == entity)
                .map(|(_, o)| EntityRef::clone(o))
                .chain(
                    set.new_objects
                        .iter()
                        .filter(|o| sync::read(o).entity_name() == entity)
                        .cloned(),
                )
                .collect();
            let deleted: HashSet<ObjectKey> = set.deleted.keys().cloned().collect();
            (candidates, deleted)
        };
        let is_deleted = |o: &EntityRef| {
            sync::read(o)
                .primary_key(desc)
                .is_some_and(|k| deleted.contains(&ObjectKey::new(entity, k)))
        };
        let criteria = clone.selection_criteria();
        let in_memory = conforming(
            project,
            desc,
            criteria,
            row,
            candidates.into_iter().filter(|o| !is_deleted(o)),
        );
        if clone.kind() == QueryKind::ReadObject {
            if let Some(first) = in_memory.first() {
                tracing::debug!(entity = entity, "Answered from the unit of work");
                return Ok(QueryResult::Object(Some(EntityRef::clone(first))));
            }
        }

        let fetched = clone.execute_with_row(self, row)?.objects();
        let ctx = ConformContext::new(project, desc, row);
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for object in fetched {
            if is_deleted(&object) {
                continue;
            }
            // A working copy changed in memory may no longer match.
            let still_matches = criteria.is_none_or(|c| c.conforms(&ctx, &sync::read(&object)) != Some(false));
            if still_matches && seen.insert(Arc::as_ptr(&object)) {
                results.push(object);
            }
        }
        for object in in_memory {
            if seen.insert(Arc::as_ptr(&object)) {
                results.push(object);
            }
        }
        tracing::debug!(entity = entity, results = results.len(), "Conformed results");
        Ok(object_result(clone.kind(), results))
    }

    /// Read one object by primary key.
    pub fn find(&self, entity: &str, key: &[Value]) -> Result<Option<EntityRef>> {
        let query = self.server.read_object_query(entity)?;
        self.execute_query(&query, key)?.into_object()
    }

    /// Read one object by primary key under query `hints`.
    pub fn find_with_hints(
        &self,
        entity: &str,
        key: &[Value],
        hints: &HashMap<String, String>,
    ) -> Result<Option<EntityRef>> {
        if hints.is_empty() {
            return self.find(entity, key);
        }
        let base = self.server.read_object_query(entity)?;
        let mut query = DatabaseQuery::clone(&base);
        apply_hints(&mut query, hints)?;
        self.execute_query(&query, key)?.into_object()
    }

    /// Instantiate reference `attribute` of a working copy.
    pub fn load_reference(&self, owner: &EntityRef, attribute: &str) -> Result<Option<EntityRef>> {
        self.check_active()?;
        let (entity, key, loaded) = {
            let o = sync::read(owner);
            let holder = o.reference(attribute);
            (
                o.entity_name().to_string(),
                holder.and_then(|h| h.key()).cloned(),
                holder.and_then(|h| h.value()).cloned(),
            )
        };
        if loaded.is_some() {
            return Ok(loaded);
        }
        let desc = self.server.project_arc().require(&entity)?;
        let Some(Mapping::Reference { target, .. }) = desc.mapping(attribute) else {
            return Err(Error::illegal_argument(format!(
                "'{attribute}' is not a reference of '{entity}'"
            )));
        };
        let Some(key) = key.filter(|k| !k.is_null()) else {
            return Ok(None);
        };
        self.profiler().record_lazy_load(&entity, attribute);
        let found = self.find(target, std::slice::from_ref(&key))?;
        if let Some(found) = &found {
            sync::write(owner).set_reference(attribute, key, EntityRef::clone(found));
        }
        Ok(found)
    }

    /// Instantiate collection `attribute` of a working copy.
    pub fn load_collection(&self, owner: &EntityRef, attribute: &str) -> Result<Vec<EntityRef>> {
        self.check_active()?;
        let (entity, owner_key, loaded) = {
            let o = sync::read(owner);
            let desc = self.server.project_arc().require(o.entity_name())?;
            (
                o.entity_name().to_string(),
                o.primary_key(desc),
                o.collection(attribute).and_then(|c| c.items()).map(<[EntityRef]>::to_vec),
            )
        };
        if let Some(items) = loaded {
            return Ok(items);
        }
        let query = self.server.collection_query(&entity, attribute)?;
        let Some(owner_id) = owner_key.and_then(|k| k.values().first().cloned()) else {
            return Ok(Vec::new());
        };
        self.profiler().record_lazy_load(&entity, attribute);
        let items = self.execute_query(&query, &[owner_id])?.into_objects()?;
        if let Some(holder) = sync::write(owner).collection_mut(attribute) {
            holder.set_items(items.clone());
        }
        Ok(items)
    }

    // ------------------------------------------------------------------------
    // Flush, commit, rollback
    // ------------------------------------------------------------------------

    /// Write pending deletes, inserts and updates to the database.
    ///
    /// Opens the transaction if none is open. The working set stays
    /// registered; only commit publishes it to the shared cache.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<FlushResult> {
        self.check_active()?;
        let project = Arc::clone(self.server.project_arc());
        let orderer = FlushOrderer::for_project(&project);
        let mut total = FlushResult::default();

        let structural = orderer.order(self.structural_ops(&project)?);
        if !structural.is_empty() {
            self.begin_early_transaction()?;
            let result = structural.execute(self.server.connection(), &project)?;
            self.after_structural(&structural, &result);
            total.absorb(result);
        }

        let updates = orderer.order(self.update_ops(&project)?);
        if !updates.is_empty() {
            self.begin_early_transaction()?;
            let result = updates.execute(self.server.connection(), &project)?;
            self.after_updates(&project, &updates)?;
            total.absorb(result);
        }
        tracing::debug!(
            inserted = total.inserted,
            updated = total.updated,
            deleted = total.deleted,
            "Flushed unit of work"
        );
        Ok(total)
    }

    fn structural_ops(&self, project: &Project) -> Result<Vec<PendingOp>> {
        let set = self.set.borrow();
        let mut ops = Vec::new();
        for (key, object) in &set.deleted {
            if set.flushed_deletes.contains(key) {
                continue;
            }
            let desc = project.require(key.entity())?;
            ops.push(PendingOp::Delete {
                key: key.clone(),
                table: desc.table().to_string(),
                pk_columns: pk_columns(desc),
                pk_values: key.key().values().to_vec(),
                version: version_of(desc, &sync::read(object)),
            });
        }
        for object in &set.new_objects {
            let mut entity = sync::write(object);
            let desc = project.require(entity.entity_name())?;
            if let Some(attribute) = desc.version_attribute() {
                if entity.value(attribute).is_none_or(Value::is_null) {
                    entity.set(attribute.to_string(), 1i64);
                }
            }
            ops.push(PendingOp::Insert {
                entity: desc.entity_name().to_string(),
                table: desc.table().to_string(),
                object: EntityRef::clone(object),
            });
        }
        Ok(ops)
    }

    fn after_structural(&self, plan: &FlushPlan, result: &FlushResult) {
        let mut guard = self.set.borrow_mut();
        let set = &mut *guard;
        for key in plan.deletes.iter().filter_map(PendingOp::key) {
            set.flushed_deletes.insert(key.clone());
        }
        set.new_objects.clear();
        for (key, object) in &result.new_keys {
            set.tracker.snapshot(key.clone(), &sync::read(object));
            set.registered.insert(key.clone(), EntityRef::clone(object));
            set.written.insert(key.clone());
        }
    }

    fn update_ops(&self, project: &Project) -> Result<Vec<PendingOp>> {
        let set = self.set.borrow();
        let mut ops = Vec::new();
        for (key, object) in &set.registered {
            if set.deleted.contains_key(key) {
                continue;
            }
            let desc = project.require(key.entity())?;
            let mut entity = sync::write(object);
            sync_reference_keys(project, desc, &mut entity);
            let version = version_of(desc, &entity);
            let version_column = version.as_ref().map(|(column, _)| column.as_str());
            let (set_columns, set_values): (Vec<String>, Vec<Value>) = set
                .tracker
                .changed_columns(key, &entity, project, desc)
                .into_iter()
                .filter(|(column, _)| Some(column.as_str()) != version_column)
                .unzip();
            if set_columns.is_empty() {
                continue;
            }
            ops.push(PendingOp::Update {
                key: key.clone(),
                table: desc.table().to_string(),
                pk_columns: pk_columns(desc),
                pk_values: key.key().values().to_vec(),
                set_columns,
                set_values,
                version,
            });
        }
        Ok(ops)
    }

    fn after_updates(&self, project: &Project, plan: &FlushPlan) -> Result<()> {
        let mut guard = self.set.borrow_mut();
        let set = &mut *guard;
        for op in &plan.updates {
            let PendingOp::Update { key, version, .. } = op else {
                continue;
            };
            let Some(object) = set.registered.get(key) else {
                continue;
            };
            let desc = project.require(key.entity())?;
            if let (Some(attribute), Some((_, current))) = (desc.version_attribute(), version) {
                sync::write(object).set(attribute.to_string(), current + 1);
            }
            set.tracker.snapshot(key.clone(), &sync::read(object));
            set.written.insert(key.clone());
        }
        Ok(())
    }

    /// Flush, commit the transaction and merge the result into the shared
    /// cache.
    ///
    /// On failure the transaction is rolled back, the shared cache is left
    /// untouched and the unit of work is closed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<MergeStats> {
        self.check_active()?;
        if let Err(e) = self.flush().and_then(|_| self.commit_transaction()) {
            tracing::warn!(error = %e, "Commit failed, rolling back");
            self.rollback_transaction();
            self.set.replace(WorkingSet::default());
            self.lifecycle.set(Lifecycle::RolledBack);
            return Err(e);
        }
        let commit_set = self.commit_set();
        self.set.replace(WorkingSet::default());
        self.lifecycle.set(Lifecycle::Committed);
        let stats = merge_commit(
            self.server.project_arc(),
            self.server.cache(),
            commit_set,
            self.store_mode,
        )?;
        tracing::info!(
            merged = stats.merged,
            evicted = stats.evicted,
            skipped = stats.skipped,
            "Unit of work committed"
        );
        Ok(stats)
    }

    fn commit_set(&self) -> CommitSet {
        let set = self.set.borrow();
        let changed = set
            .written
            .iter()
            .filter(|key| !set.deleted.contains_key(*key))
            .filter_map(|key| {
                set.registered
                    .get(key)
                    .map(|o| (key.clone(), sync::read(o).clone()))
            })
            .collect();
        CommitSet {
            changed,
            deleted: set.deleted.keys().cloned().collect(),
            invalidated: set.invalidated.clone(),
        }
    }

    /// Discard the working set and roll back any open transaction. The
    /// shared cache is never touched.
    pub fn rollback(&mut self) {
        if self.lifecycle.get() != Lifecycle::Active {
            return;
        }
        self.rollback_transaction();
        self.set.replace(WorkingSet::default());
        self.lifecycle.set(Lifecycle::RolledBack);
        tracing::debug!("Unit of work rolled back");
    }

    /// Close the unit of work, rolling back an open transaction.
    pub fn release(&mut self) {
        if self.lifecycle.get() == Lifecycle::Released {
            return;
        }
        self.rollback_transaction();
        self.set.replace(WorkingSet::default());
        self.lifecycle.set(Lifecycle::Released);
        tracing::trace!("Unit of work released");
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.set.borrow();
        f.debug_struct("UnitOfWork")
            .field("lifecycle", &self.lifecycle.get())
            .field("registered", &set.registered.len())
            .field("new", &set.new_objects.len())
            .field("deleted", &set.deleted.len())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

fn pk_columns(desc: &ClassDescriptor) -> Vec<String> {
    desc.primary_key_columns()
        .into_iter()
        .map(String::from)
        .collect()
}

fn version_of(desc: &ClassDescriptor, entity: &Entity) -> Option<(String, i64)> {
    let attribute = desc.version_attribute()?;
    let column = desc.direct_column(attribute)?;
    let current = entity.value(attribute)?.as_i64()?;
    Some((column.to_string(), current))
}

impl QuerySession for UnitOfWork<'_> {
    fn project(&self) -> &Project {
        self.server.project_arc()
    }

    fn dialect(&self) -> Dialect {
        self.server.connection().dialect()
    }

    fn profiler(&self) -> &QueryProfiler {
        self.server.profiler()
    }

    fn default_timeout(&self) -> QueryTimeout {
        self.server.config().default_timeout
    }

    fn default_bind_all_parameters(&self) -> bool {
        self.server.config().bind_all_parameters
    }

    fn default_cache_statement(&self) -> bool {
        self.server.config().cache_statements
    }

    fn default_retrieve_mode(&self) -> CacheRetrieveMode {
        self.retrieve_mode
    }

    fn default_store_mode(&self) -> CacheStoreMode {
        self.store_mode
    }

    fn is_unit_of_work(&self) -> bool {
        true
    }

    fn check_early_return(
        &self,
        query: &DatabaseQuery,
        row: &TranslationRow,
    ) -> Result<EarlyReturn> {
        let kind = query.kind();
        if !kind.is_object_level_read_query() {
            return Ok(EarlyReturn::Unknown);
        }
        let Some(entity) = query.reference_entity() else {
            return Ok(EarlyReturn::Unknown);
        };
        let desc = self.server.project_arc().require(entity)?;

        if kind == QueryKind::ReadObject && query.store_mode(self) != CacheStoreMode::Refresh {
            if let Some(pk) = query.selection_criteria().and_then(|c| c.primary_key(desc, row)) {
                let key = ObjectKey::new(entity, pk);
                let set = self.set.borrow();
                if set.deleted.contains_key(&key) {
                    return Ok(EarlyReturn::KnownAbsent);
                }
                let found = set.registered.get(&key).cloned().or_else(|| {
                    set.new_objects
                        .iter()
                        .find(|o| sync::read(o).primary_key(desc).as_ref() == Some(key.key()))
                        .cloned()
                });
                if let Some(found) = found {
                    tracing::trace!(object = %key, "Answered from the unit of work");
                    return Ok(EarlyReturn::Found(QueryResult::Object(Some(found))));
                }
            }
        }

        if self.in_transaction() {
            return Ok(EarlyReturn::Unknown);
        }
        match check_shared_cache(self, self.server.cache(), query, row)? {
            EarlyReturn::Found(result) => {
                let objects = result
                    .objects()
                    .into_iter()
                    .map(|o| self.register_built(desc, Built::Shared(o), false))
                    .collect::<Result<Vec<_>>>()?;
                Ok(EarlyReturn::Found(object_result(kind, objects)))
            }
            other => Ok(other),
        }
    }

    fn execute_call(
        &self,
        query: &DatabaseQuery,
        call: &PreparedCall,
        row: &TranslationRow,
    ) -> Result<QueryResult> {
        let raw = run_call(self.server.connection(), call, row)?;
        let kind = query.kind();
        if kind.is_object_level_read_query() {
            let store = query.store_mode(self);
            // Inside a transaction rows may be uncommitted and stay private.
            let (retrieve, build_store) = if self.in_transaction() {
                (CacheRetrieveMode::Bypass, CacheStoreMode::Bypass)
            } else {
                (query.retrieve_mode(self), store)
            };
            let built = build_objects(
                self,
                self.server.cache(),
                query,
                &raw.into_rows(),
                retrieve,
                build_store,
            )?;
            let desc = self
                .server
                .project_arc()
                .require(query.reference_entity().unwrap_or_default())?;
            let objects = built
                .into_iter()
                .map(|b| self.register_built(desc, b, store == CacheStoreMode::Refresh))
                .collect::<Result<Vec<_>>>()?;
            return Ok(object_result(kind, objects));
        }
        match (kind, raw) {
            (QueryKind::UpdateAll | QueryKind::DeleteAll, raw) => {
                if let Some(entity) = query.reference_entity() {
                    self.set.borrow_mut().invalidated.insert(entity.to_string());
                }
                Ok(QueryResult::RowCount(raw.into_count()))
            }
            (_, RawResult::Rows(rows)) => Ok(QueryResult::Rows(rows)),
            (_, RawResult::Count(n)) => Ok(QueryResult::RowCount(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use persist_core::{
        AttributeType, Connection, LockMode, PrimaryKey, QueryError, QueryErrorKind, Row,
        UsageErrorKind,
    };
    use persist_query::Expression;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers every query with the same rows and records statements.
    #[derive(Debug, Default)]
    struct ScriptedConnection {
        rows: Vec<Row>,
        failure: Option<QueryErrorKind>,
        statements: Mutex<Vec<String>>,
        in_transaction: Mutex<bool>,
    }

    impl ScriptedConnection {
        fn returning(rows: Vec<Row>) -> Self {
            Self {
                rows,
                ..Self::default()
            }
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    impl Connection for ScriptedConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn query(&self, sql: &str, _params: &[Value], _timeout: Option<Duration>) -> Result<Vec<Row>> {
            self.statements.lock().unwrap().push(sql.to_string());
            if let Some(kind) = self.failure {
                return Err(Error::Query(QueryError::new(kind, "scripted failure")));
            }
            Ok(self.rows.clone())
        }

        fn execute(&self, sql: &str, _params: &[Value], _timeout: Option<Duration>) -> Result<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(1)
        }

        fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
            self.execute(sql, params, None)?;
            Ok(1)
        }

        fn begin(&self) -> Result<()> {
            self.statements.lock().unwrap().push("BEGIN".into());
            *self.in_transaction.lock().unwrap() = true;
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            self.statements.lock().unwrap().push("COMMIT".into());
            *self.in_transaction.lock().unwrap() = false;
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            self.statements.lock().unwrap().push("ROLLBACK".into());
            *self.in_transaction.lock().unwrap() = false;
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            *self.in_transaction.lock().unwrap()
        }
    }

    fn project() -> Project {
        Project::new().with(
            ClassDescriptor::entity("Employee", "EMPLOYEE")
                .id("id", "EMP_ID", AttributeType::Integer)
                .direct("name", "NAME", AttributeType::Text),
        )
    }

    fn ann() -> Row {
        Row::new(
            vec!["EMP_ID".into(), "NAME".into()],
            vec![Value::BigInt(1), Value::Text("Ann".into())],
        )
    }

    fn server(rows: Vec<Row>) -> (ServerSession, Arc<ScriptedConnection>) {
        let conn = Arc::new(ScriptedConnection::returning(rows));
        let server = ServerSession::new(project(), conn.clone(), SessionConfig::default()).unwrap();
        (server, conn)
    }

    fn failing_server(kind: QueryErrorKind) -> (ServerSession, Arc<ScriptedConnection>) {
        let conn = Arc::new(ScriptedConnection {
            failure: Some(kind),
            ..ScriptedConnection::default()
        });
        let server = ServerSession::new(project(), conn.clone(), SessionConfig::default()).unwrap();
        (server, conn)
    }

    /// Statements logged after the first `BEGIN`.
    fn after_begin(conn: &ScriptedConnection) -> Vec<String> {
        conn.statements()
            .into_iter()
            .skip_while(|s| s != "BEGIN")
            .skip(1)
            .collect()
    }

    fn one() -> PrimaryKey {
        PrimaryKey::single(1i64)
    }

    #[test]
    fn reads_return_working_copies_not_cached_instances() {
        let (server, _) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        let cached = server.cache().get("Employee", &one()).unwrap();
        assert!(!Arc::ptr_eq(&working, &cached));
        assert_eq!(uow.state_of(&working), ObjectState::Managed);

        // A second read answers from the working set.
        let again = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        assert!(Arc::ptr_eq(&working, &again));
    }

    #[test]
    fn changes_reach_the_cache_only_on_commit() {
        let (server, conn) = server(vec![ann()]);
        let mut uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        working.write().unwrap().set("name", "Bea");
        assert_eq!(uow.pending_counts().dirty, 1);

        let cached = server.cache().get("Employee", &one()).unwrap();
        assert_eq!(cached.read().unwrap().value("name"), Some(&Value::Text("Ann".into())));

        let stats = uow.commit().unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(cached.read().unwrap().value("name"), Some(&Value::Text("Bea".into())));
        let statements = conn.statements();
        assert!(statements.contains(&"BEGIN".to_string()));
        assert!(statements.iter().any(|s| s.starts_with("UPDATE \"EMPLOYEE\" SET \"NAME\"")));
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn rollback_leaves_the_cache_untouched() {
        let (server, conn) = server(vec![ann()]);
        let mut uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        working.write().unwrap().set("name", "Bea");
        uow.flush().unwrap();
        uow.rollback();

        let cached = server.cache().get("Employee", &one()).unwrap();
        assert_eq!(cached.read().unwrap().value("name"), Some(&Value::Text("Ann".into())));
        assert_eq!(conn.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert!(!uow.is_active());
    }

    #[test]
    fn deleted_objects_are_known_absent_and_evicted_on_commit() {
        let (server, _) = server(vec![ann()]);
        let mut uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        uow.delete_object(&working).unwrap();
        assert_eq!(uow.state_of(&working), ObjectState::Deleted);
        assert!(uow.find("Employee", &[Value::BigInt(1)]).unwrap().is_none());

        let stats = uow.commit().unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(!server.cache().contains("Employee", &one()));
    }

    #[test]
    fn conforming_read_sees_unflushed_changes() {
        let (server, _) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        working.write().unwrap().set("name", "Bea");
        let added = uow
            .register_new_object(Entity::new("Employee").with("id", 2i64).with("name", "Ann"))
            .unwrap();

        let mut query = DatabaseQuery::read_all("Employee");
        query.set_selection_criteria(Expression::attr("name").equal("Ann"));
        query.set_conform_results_in_unit_of_work(true);
        let results = uow.execute_query(&query, &[]).unwrap().objects();

        assert_eq!(results.len(), 1);
        assert!(Arc::ptr_eq(&results[0], &added));
        assert!(!uow.is_conforming());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (server, _) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        uow.find("Employee", &[Value::BigInt(1)]).unwrap();
        let err = uow
            .register_new_object(Entity::new("Employee").with("id", 1i64))
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::IllegalArgument));
    }

    #[test]
    fn closed_unit_of_work_rejects_work() {
        let (server, _) = server(vec![ann()]);
        let mut uow = server.acquire_unit_of_work(HashMap::new());
        uow.commit().unwrap();
        let err = uow.find("Employee", &[Value::BigInt(1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Closed,
                ..
            })
        ));
    }

    #[test]
    fn store_mode_property_sets_the_default() {
        let (server, _) = server(vec![]);
        let props = HashMap::from([(hints::CACHE_STORE_MODE.to_string(), "BYPASS".to_string())]);
        let uow = server.acquire_unit_of_work(props);
        assert_eq!(uow.default_store_mode(), CacheStoreMode::Bypass);
        assert_eq!(uow.default_retrieve_mode(), CacheRetrieveMode::Use);
    }

    #[test]
    fn auto_flush_runs_pending_updates_before_a_query() {
        let (server, conn) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        sync::write(&working).set("name", "Bea");
        uow.begin_early_transaction().unwrap();

        uow.execute_query(&DatabaseQuery::read_all("Employee"), &[])
            .unwrap();
        let statements = after_begin(&conn);
        assert_eq!(statements.len(), 2, "{statements:?}");
        assert!(statements[0].starts_with("UPDATE \"EMPLOYEE\""));
        assert!(statements[1].starts_with("SELECT"));
        assert_eq!(uow.pending_counts().dirty, 0);
    }

    #[test]
    fn no_flush_before_a_query_without_a_transaction() {
        let (server, conn) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        sync::write(&working).set("name", "Bea");

        uow.execute_query(&DatabaseQuery::read_all("Employee"), &[])
            .unwrap();
        let statements = conn.statements();
        assert!(statements.iter().all(|s| s.starts_with("SELECT")), "{statements:?}");
        assert!(!uow.in_transaction());
        assert_eq!(uow.pending_counts().dirty, 1);
    }

    #[test]
    fn commit_flush_mode_on_the_query_suppresses_the_flush() {
        let (server, conn) = server(vec![ann()]);
        let uow = server.acquire_unit_of_work(HashMap::new());
        let working = uow.find("Employee", &[Value::BigInt(1)]).unwrap().unwrap();
        sync::write(&working).set("name", "Bea");
        uow.begin_early_transaction().unwrap();

        let mut query = DatabaseQuery::read_all("Employee");
        query.set_flush_mode(Some(FlushMode::Commit));
        uow.execute_query(&query, &[]).unwrap();
        let statements = after_begin(&conn);
        assert_eq!(statements.len(), 1, "{statements:?}");
        assert!(statements[0].starts_with("SELECT"));
        assert_eq!(uow.pending_counts().dirty, 1);
    }

    #[test]
    fn conforming_marker_is_reset_when_the_read_fails() {
        let (server, conn) = failing_server(QueryErrorKind::Database);
        let uow = server.acquire_unit_of_work(HashMap::new());

        let mut query = DatabaseQuery::read_all("Employee");
        query.set_selection_criteria(Expression::attr("name").equal("Ann"));
        query.set_conform_results_in_unit_of_work(true);
        let err = uow.execute_query(&query, &[]).unwrap_err();
        assert!(err.is_database_error());
        assert!(!conn.statements().is_empty());
        assert!(!uow.is_conforming());

        // The unit of work stays usable.
        assert!(uow.is_active());
        assert!(uow.find("Employee", &[Value::BigInt(2)]).is_err());
        assert!(!uow.is_conforming());
    }

    #[test]
    fn database_errors_in_a_transaction_roll_it_back() {
        let (server, conn) = failing_server(QueryErrorKind::Database);
        let uow = server.acquire_unit_of_work(HashMap::new());
        uow.register_new_object(Entity::new("Employee").with("id", 5i64).with("name", "Cy"))
            .unwrap();
        uow.begin_early_transaction().unwrap();

        let err = uow
            .execute_query(&DatabaseQuery::read_all("Employee"), &[])
            .unwrap_err();
        assert!(err.requires_rollback());
        assert!(!uow.is_active());
        assert!(!uow.in_transaction());
        assert_eq!(conn.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(uow.pending_counts().total(), 0);
    }

    #[test]
    fn lock_timeouts_keep_the_transaction() {
        let (server, conn) = failing_server(QueryErrorKind::LockNotAvailable);
        let uow = server.acquire_unit_of_work(HashMap::new());
        uow.begin_early_transaction().unwrap();

        let mut query = DatabaseQuery::read_all("Employee");
        query.set_lock_mode(LockMode::PessimisticNoWait);
        let err = uow.execute_query(&query, &[]).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(uow.is_active());
        assert!(uow.in_transaction());
        assert!(!conn.statements().contains(&"ROLLBACK".to_string()));
    }
}
