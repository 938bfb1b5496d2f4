//! Pieces of query execution shared by the server session and units of work.

use crate::identity_map::SharedCache;
use crate::object_builder::{Built, ObjectBuilder};
use persist_core::sync;
use persist_core::{
    ClassDescriptor, Connection, EntityRef, Error, LockMode, Project, Result, Row,
};
use persist_query::{
    CacheRetrieveMode, CacheStoreMode, CacheUsage, ConformContext, DatabaseQuery, EarlyReturn,
    Expression, PreparedCall, QueryKind, QueryResult, QuerySession, TranslationRow,
};

/// What the database returned for a call.
#[derive(Debug)]
pub(crate) enum RawResult {
    Rows(Vec<Row>),
    Count(u64),
}

/// Bind and run a prepared call.
pub(crate) fn run_call(
    conn: &dyn Connection,
    call: &PreparedCall,
    row: &TranslationRow,
) -> Result<RawResult> {
    let params = call.bind(row)?;
    tracing::debug!(sql = %call.sql, params = params.len(), "Executing call");
    let outcome = if call.returns_rows() {
        let rows = if call.cache_statement {
            conn.query_cached(&call.sql, &params, call.timeout)
        } else {
            conn.query(&call.sql, &params, call.timeout)
        };
        rows.map(RawResult::Rows)
    } else {
        let count = if call.cache_statement {
            conn.execute_cached(&call.sql, &params, call.timeout)
        } else {
            conn.execute(&call.sql, &params, call.timeout)
        };
        count.map(RawResult::Count)
    };
    match outcome {
        Err(err) if call.lock_mode != LockMode::None => {
            Err(conn.dialect().classify_lock_error(err))
        }
        other => other,
    }
}

impl RawResult {
    pub(crate) fn into_rows(self) -> Vec<Row> {
        match self {
            RawResult::Rows(rows) => rows,
            RawResult::Count(_) => Vec::new(),
        }
    }

    pub(crate) fn into_count(self) -> u64 {
        match self {
            RawResult::Rows(rows) => rows.len() as u64,
            RawResult::Count(n) => n,
        }
    }
}

/// Build the rows of an object read into objects of its reference entity.
pub(crate) fn build_objects(
    session: &dyn QuerySession,
    cache: &SharedCache,
    query: &DatabaseQuery,
    rows: &[Row],
    retrieve: CacheRetrieveMode,
    store: CacheStoreMode,
) -> Result<Vec<Built>> {
    let entity = query.reference_entity().ok_or_else(|| {
        Error::illegal_state(format!(
            "object query '{}' has no reference entity",
            query.display_name()
        ))
    })?;
    let project = session.project();
    let desc = project.require(entity)?;
    tracing::trace!(entity = entity, rows = rows.len(), retrieve = ?retrieve, store = ?store, "Building objects");
    ObjectBuilder::new(project, desc, cache, retrieve, store).build_all(rows)
}

/// Wrap built objects in the result shape of `kind`.
pub(crate) fn object_result(kind: QueryKind, objects: Vec<EntityRef>) -> QueryResult {
    if kind == QueryKind::ReadObject {
        QueryResult::Object(objects.into_iter().next())
    } else {
        QueryResult::Objects(objects)
    }
}

/// The candidates that satisfy `criteria`. Undecidable candidates do not.
pub(crate) fn conforming(
    project: &Project,
    desc: &ClassDescriptor,
    criteria: Option<&Expression>,
    row: &TranslationRow,
    candidates: impl IntoIterator<Item = EntityRef>,
) -> Vec<EntityRef> {
    let ctx = ConformContext::new(project, desc, row);
    candidates
        .into_iter()
        .filter(|candidate| {
            let entity = sync::read(candidate);
            criteria.map_or(Some(true), |c| c.conforms(&ctx, &entity)) == Some(true)
        })
        .collect()
}

/// Answer an object read from the shared cache when its cache usage allows.
pub(crate) fn check_shared_cache(
    session: &dyn QuerySession,
    cache: &SharedCache,
    query: &DatabaseQuery,
    row: &TranslationRow,
) -> Result<EarlyReturn> {
    if !query.kind().is_object_level_read_query() {
        return Ok(EarlyReturn::Unknown);
    }
    let Some(entity) = query.reference_entity() else {
        return Ok(EarlyReturn::Unknown);
    };
    let project = session.project();
    let desc = project.require(entity)?;
    if desc.cache_isolation().is_isolated() {
        return Ok(EarlyReturn::Unknown);
    }

    let usage = query.effective_cache_usage(session);
    let answer = match usage {
        CacheUsage::DoNotCheckCache | CacheUsage::UseDescriptorSetting => EarlyReturn::Unknown,
        CacheUsage::CheckCacheByPrimaryKey => {
            let key = query
                .selection_criteria()
                .and_then(|c| c.primary_key(desc, row));
            match key.and_then(|k| cache.get(entity, &k)) {
                Some(found) if query.kind().is_read_object_query() => {
                    EarlyReturn::Found(QueryResult::Object(Some(found)))
                }
                _ => EarlyReturn::Unknown,
            }
        }
        CacheUsage::CheckCacheThenDatabase | CacheUsage::CheckCacheOnly => {
            let only = usage == CacheUsage::CheckCacheOnly;
            let matches = conforming(
                project,
                desc,
                query.selection_criteria(),
                row,
                cache.objects(entity),
            );
            match query.kind() {
                QueryKind::ReadObject => match matches.into_iter().next() {
                    Some(found) => EarlyReturn::Found(QueryResult::Object(Some(found))),
                    None if only => EarlyReturn::KnownAbsent,
                    None => EarlyReturn::Unknown,
                },
                _ if only => EarlyReturn::Found(QueryResult::Objects(matches)),
                _ => EarlyReturn::Unknown,
            }
        }
    };
    if matches!(answer, EarlyReturn::Found(_)) {
        session.profiler().record_cache_hit();
        tracing::debug!(entity = entity, usage = ?usage, "Shared cache hit");
    }
    Ok(answer)
}

/// Check a query-results cache hit against the shared cache.
///
/// A hit is stale once any of its objects is no longer the cached instance.
pub(crate) fn validate_against_cache(
    project: &Project,
    cache: &SharedCache,
    result: QueryResult,
) -> Result<Option<QueryResult>> {
    for object in result.objects() {
        let entity = sync::read(&object);
        let desc = project.require(entity.entity_name())?;
        let Some(key) = entity.primary_key(desc) else {
            return Ok(None);
        };
        match cache.get(desc.entity_name(), &key) {
            Some(cached) if std::sync::Arc::ptr_eq(&cached, &object) => {}
            _ => {
                tracing::debug!(entity = desc.entity_name(), key = %key, "Cached query result is stale");
                return Ok(None);
            }
        }
    }
    Ok(Some(result))
}
