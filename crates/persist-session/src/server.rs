//! The process-wide session.
//!
//! A [`ServerSession`] owns the mapping project, the shared cache, the
//! connection and every registered query. It is `Sync`: any number of threads
//! execute queries through it concurrently, and each client acquires its own
//! [`UnitOfWork`] for transactional work.

use crate::config::SessionConfig;
use crate::execution::{
    RawResult, build_objects, check_shared_cache, object_result, run_call, validate_against_cache,
};
use crate::identity_map::SharedCache;
use crate::unit_of_work::UnitOfWork;
use persist_core::sync;
use persist_core::{
    Connection, Dialect, EntityRef, Error, Mapping, Project, QueryTimeout, Result, Value,
};
use persist_query::{
    CacheRetrieveMode, CacheStoreMode, DatabaseQuery, EarlyReturn, Expression, ParseCache,
    PreparedCall, QueryKind, QueryProfiler, QueryResult, QuerySession, TranslationRow, apply_hints,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Shared, thread-safe session over one project and connection.
pub struct ServerSession {
    project: Arc<Project>,
    connection: Arc<dyn Connection>,
    config: SessionConfig,
    cache: SharedCache,
    profiler: QueryProfiler,
    parse_cache: ParseCache,
    named_queries: RwLock<HashMap<String, Arc<DatabaseQuery>>>,
    /// Descriptor default queries, keyed by entity or `entity.attribute`.
    default_queries: RwLock<HashMap<String, Arc<DatabaseQuery>>>,
    /// Held by the unit of work whose transaction is open on the connection.
    pub(crate) transaction_gate: Mutex<()>,
}

impl ServerSession {
    /// Create a session, initializing `project` if that has not happened yet.
    pub fn new(
        mut project: Project,
        connection: Arc<dyn Connection>,
        config: SessionConfig,
    ) -> Result<Self> {
        if !project.is_initialized() {
            project.initialize()?;
        }
        tracing::debug!(
            descriptors = project.descriptors().count(),
            dialect = ?connection.dialect(),
            "Server session created"
        );
        Ok(Self {
            project: Arc::new(project),
            cache: SharedCache::new().with_size_override(config.identity_map_size),
            profiler: QueryProfiler::new().with_lazy_load_threshold(config.lazy_load_threshold),
            parse_cache: ParseCache::new(config.parse_cache_size),
            connection,
            config,
            named_queries: RwLock::new(HashMap::new()),
            default_queries: RwLock::new(HashMap::new()),
            transaction_gate: Mutex::new(()),
        })
    }

    pub fn project_arc(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn parse_cache(&self) -> &ParseCache {
        &self.parse_cache
    }

    /// Start a transactional working set. `properties` are merged over the
    /// configured tenant properties.
    pub fn acquire_unit_of_work(&self, properties: HashMap<String, String>) -> UnitOfWork<'_> {
        let mut merged = self.config.tenant_properties.clone();
        merged.extend(properties);
        UnitOfWork::new(self, merged)
    }

    // ------------------------------------------------------------------------
    // Query registry
    // ------------------------------------------------------------------------

    /// Register `query` under `name`, replacing any query of that name.
    pub fn add_named_query(&self, name: impl Into<String>, mut query: DatabaseQuery) {
        let name = name.into();
        query.set_name(name.clone());
        tracing::debug!(query = %name, kind = ?query.kind(), "Registered named query");
        sync::write(&self.named_queries).insert(name, Arc::new(query));
    }

    pub fn named_query(&self, name: &str) -> Result<Arc<DatabaseQuery>> {
        sync::read(&self.named_queries)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no query named '{name}'")))
    }

    /// A query for JPQL `text`.
    ///
    /// Without hints the parsed query is shared through the parse cache; a
    /// hinted query is parsed for this caller alone.
    pub fn jpql_query(
        &self,
        text: &str,
        hints: &HashMap<String, String>,
    ) -> Result<Arc<DatabaseQuery>> {
        if hints.is_empty() {
            return self.parse_cache.get_or_parse(text, || DatabaseQuery::jpql(text));
        }
        let mut query = DatabaseQuery::jpql(text)?;
        apply_hints(&mut query, hints)?;
        Ok(Arc::new(query))
    }

    /// The default read-by-primary-key query of `entity`.
    pub fn read_object_query(&self, entity: &str) -> Result<Arc<DatabaseQuery>> {
        if let Some(q) = sync::read(&self.default_queries).get(entity) {
            return Ok(Arc::clone(q));
        }
        let desc = self.project.require(entity)?;
        let query = Arc::new(DatabaseQuery::read_object_by_key(desc));
        Ok(Arc::clone(
            sync::write(&self.default_queries)
                .entry(entity.to_string())
                .or_insert(query),
        ))
    }

    /// The query loading collection `attribute` of `entity` by owner key.
    pub(crate) fn collection_query(
        &self,
        entity: &str,
        attribute: &str,
    ) -> Result<Arc<DatabaseQuery>> {
        let cache_key = format!("{entity}.{attribute}");
        if let Some(q) = sync::read(&self.default_queries).get(&cache_key) {
            return Ok(Arc::clone(q));
        }
        let desc = self.project.require(entity)?;
        let Some(Mapping::Collection {
            target, mapped_by, ..
        }) = desc.mapping(attribute)
        else {
            return Err(Error::illegal_argument(format!(
                "'{attribute}' is not a collection of '{entity}'"
            )));
        };
        let mut query = DatabaseQuery::read_all(target.clone());
        query.add_argument("owner", None);
        query.set_selection_criteria(Expression::attr(mapped_by.clone()).equal(Expression::param("owner")));
        let query = Arc::new(query);
        Ok(Arc::clone(
            sync::write(&self.default_queries)
                .entry(cache_key)
                .or_insert(query),
        ))
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn execute_query(&self, query: &DatabaseQuery, args: &[Value]) -> Result<QueryResult> {
        query.execute(self, args)
    }

    /// Read one object by primary key through the shared cache.
    pub fn find(&self, entity: &str, key: &[Value]) -> Result<Option<EntityRef>> {
        self.read_object_query(entity)?
            .execute(self, key)?
            .into_object()
    }

    /// Instantiate reference `attribute` of `owner`.
    ///
    /// A cached owner of a protected relationship gets the target back but
    /// its shared state is left without it.
    pub fn load_reference(&self, owner: &EntityRef, attribute: &str) -> Result<Option<EntityRef>> {
        let (entity, owner_key, holder_key, loaded) = {
            let o = sync::read(owner);
            let desc = self.project.require(o.entity_name())?;
            let holder = o.reference(attribute);
            (
                o.entity_name().to_string(),
                o.primary_key(desc),
                holder.and_then(|h| h.key()).cloned(),
                holder.and_then(|h| h.value()).cloned(),
            )
        };
        if loaded.is_some() {
            return Ok(loaded);
        }
        let desc = self.project.require(&entity)?;
        let Some(Mapping::Reference { target, .. }) = desc.mapping(attribute) else {
            return Err(Error::illegal_argument(format!(
                "'{attribute}' is not a reference of '{entity}'"
            )));
        };
        let cached = owner_key
            .and_then(|k| self.cache.lookup(&entity, &k))
            .filter(|e| Arc::ptr_eq(&e.object, owner));
        let key = holder_key.or_else(|| {
            cached
                .as_ref()
                .and_then(|e| e.protected_foreign_keys.get(attribute).cloned())
        });
        let Some(key) = key.filter(|k| !k.is_null()) else {
            return Ok(None);
        };

        self.profiler.record_lazy_load(&entity, attribute);
        let found = self.find(target, std::slice::from_ref(&key))?;
        if let Some(found) = &found {
            if cached.is_none() || self.project.is_shared_isolation(target) {
                sync::write(owner).set_reference(attribute, key, EntityRef::clone(found));
            }
        }
        Ok(found)
    }

    /// Instantiate collection `attribute` of `owner`.
    pub fn load_collection(&self, owner: &EntityRef, attribute: &str) -> Result<Vec<EntityRef>> {
        let (entity, owner_key, loaded) = {
            let o = sync::read(owner);
            let desc = self.project.require(o.entity_name())?;
            (
                o.entity_name().to_string(),
                o.primary_key(desc),
                o.collection(attribute).and_then(|c| c.items()).map(<[EntityRef]>::to_vec),
            )
        };
        if let Some(items) = loaded {
            return Ok(items);
        }
        let query = self.collection_query(&entity, attribute)?;
        let Some(owner_key) = owner_key else {
            return Ok(Vec::new());
        };
        let Some(owner_id) = owner_key.values().first().cloned() else {
            return Ok(Vec::new());
        };
        let target = query.reference_entity().unwrap_or_default().to_string();

        self.profiler.record_lazy_load(&entity, attribute);
        let items = query.execute(self, &[owner_id])?.into_objects()?;
        let cached = self
            .cache
            .get(&entity, &owner_key)
            .is_some_and(|c| Arc::ptr_eq(&c, owner));
        if !cached || self.project.is_shared_isolation(&target) {
            if let Some(holder) = sync::write(owner).collection_mut(attribute) {
                holder.set_items(items.clone());
            }
        }
        Ok(items)
    }
}

impl QuerySession for ServerSession {
    fn project(&self) -> &Project {
        &self.project
    }

    fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }

    fn profiler(&self) -> &QueryProfiler {
        &self.profiler
    }

    fn default_timeout(&self) -> QueryTimeout {
        self.config.default_timeout
    }

    fn default_bind_all_parameters(&self) -> bool {
        self.config.bind_all_parameters
    }

    fn default_cache_statement(&self) -> bool {
        self.config.cache_statements
    }

    fn default_retrieve_mode(&self) -> CacheRetrieveMode {
        self.config.retrieve_mode
    }

    fn default_store_mode(&self) -> CacheStoreMode {
        self.config.store_mode
    }

    fn check_early_return(
        &self,
        query: &DatabaseQuery,
        row: &TranslationRow,
    ) -> Result<EarlyReturn> {
        check_shared_cache(self, &self.cache, query, row)
    }

    fn execute_call(
        &self,
        query: &DatabaseQuery,
        call: &PreparedCall,
        row: &TranslationRow,
    ) -> Result<QueryResult> {
        let raw = run_call(self.connection.as_ref(), call, row)?;
        let kind = query.kind();
        if kind.is_object_level_read_query() {
            let built = build_objects(
                self,
                &self.cache,
                query,
                &raw.into_rows(),
                query.retrieve_mode(self),
                query.store_mode(self),
            )?;
            let objects = built.into_iter().map(|b| b.into_object()).collect();
            return Ok(object_result(kind, objects));
        }
        match (kind, raw) {
            (QueryKind::UpdateAll | QueryKind::DeleteAll, raw) => {
                if let Some(entity) = query.reference_entity() {
                    self.cache.invalidate(entity);
                }
                Ok(QueryResult::RowCount(raw.into_count()))
            }
            (_, RawResult::Rows(rows)) => Ok(QueryResult::Rows(rows)),
            (_, RawResult::Count(n)) => Ok(QueryResult::RowCount(n)),
        }
    }

    fn validate_cached_result(
        &self,
        query: &DatabaseQuery,
        result: QueryResult,
    ) -> Result<Option<QueryResult>> {
        let isolated = query
            .reference_entity()
            .and_then(|e| self.project.descriptor(e))
            .is_some_and(|d| d.cache_isolation().is_isolated());
        if isolated {
            return Ok(None);
        }
        validate_against_cache(&self.project, &self.cache, result)
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("dialect", &self.connection.dialect())
            .field("cached", &self.cache.total_len())
            .field("named_queries", &sync::read(&self.named_queries).len())
            .finish_non_exhaustive()
    }
}
