//! Database queries and the execution pipeline.
//!
//! A [`DatabaseQuery`] describes a query: its kind, reference entity,
//! arguments, criteria and cache policy. It is prepared once, lazily, into a
//! [`PreparedCall`] and can then be executed by any number of threads at once.
//!
//! # Execution
//!
//! [`DatabaseQuery::execute`] runs these steps in order:
//!
//! 1. translate positional argument values into a [`TranslationRow`]
//! 2. delegate to the redirector, if one is set
//! 3. answer from the query-results cache or the session's early-return hook
//! 4. substitute the descriptor's custom query for default queries
//! 5. prepare (double-checked, at most once per instance)
//! 6. clone for execution unless this instance already is an execution clone
//! 7. run the call through the session
//! 8. let the original harvest state from the clone
//!
//! Only step 5 takes a lock. Everything an execution mutates lives on its
//! clone or in the translation row, which is a per-call value.

use crate::call::{Call, PreparedCall, TranslationRow};
use crate::expr::{Expression, OrderItem, ReportItem};
use crate::jpql::{self, JpqlStatementKind, SelectItem};
use crate::mechanism::{self, QueryMechanism, SqlStatement};
use crate::options::{
    CacheRetrieveMode, CacheStoreMode, CacheUsage, CascadePolicy, FlushMode,
};
use crate::profile::QueryProfiler;
use persist_core::sync;
use persist_core::{
    AttributeType, ClassDescriptor, Dialect, EntityRef, Error, LockMode, Project, QueryTimeout,
    Result, Row, TriState, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Entries kept in a query's results cache.
pub const QUERY_RESULTS_CACHE_SIZE: usize = 100;

// ============================================================================
// Query kinds and results
// ============================================================================

/// What a query does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Read one object.
    ReadObject,
    /// Read every matching object.
    ReadAll,
    /// Read attribute values and aggregates as rows.
    Report,
    /// Read raw rows through custom SQL.
    DataRead,
    /// Run a custom modifying statement.
    DataModify,
    /// Bulk update.
    UpdateAll,
    /// Bulk delete.
    DeleteAll,
}

impl QueryKind {
    pub const fn is_read_query(self) -> bool {
        matches!(
            self,
            QueryKind::ReadObject | QueryKind::ReadAll | QueryKind::Report | QueryKind::DataRead
        )
    }

    pub const fn is_object_level_read_query(self) -> bool {
        matches!(self, QueryKind::ReadObject | QueryKind::ReadAll)
    }

    pub const fn is_read_object_query(self) -> bool {
        matches!(self, QueryKind::ReadObject)
    }

    pub const fn is_read_all_query(self) -> bool {
        matches!(self, QueryKind::ReadAll)
    }

    pub const fn is_report_query(self) -> bool {
        matches!(self, QueryKind::Report)
    }

    pub const fn is_data_read_query(self) -> bool {
        matches!(self, QueryKind::DataRead)
    }

    pub const fn is_modify_query(self) -> bool {
        !self.is_read_query()
    }

    pub const fn is_modify_all_query(self) -> bool {
        matches!(self, QueryKind::UpdateAll | QueryKind::DeleteAll)
    }

    pub const fn is_data_modify_query(self) -> bool {
        matches!(self, QueryKind::DataModify)
    }
}

/// A declared query argument.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryArgument {
    pub name: String,
    /// `None` takes the type of the attribute the argument is compared with.
    pub attribute_type: Option<AttributeType>,
}

/// The result of one execution.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Object(Option<EntityRef>),
    Objects(Vec<EntityRef>),
    Rows(Vec<Row>),
    RowCount(u64),
}

impl QueryResult {
    /// Number of objects or rows, or the affected row count.
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Object(o) => usize::from(o.is_some()),
            QueryResult::Objects(v) => v.len(),
            QueryResult::Rows(r) => r.len(),
            QueryResult::RowCount(n) => usize::try_from(*n).unwrap_or(usize::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single object; a list yields its first element.
    pub fn into_object(self) -> Result<Option<EntityRef>> {
        match self {
            QueryResult::Object(o) => Ok(o),
            QueryResult::Objects(v) => Ok(v.into_iter().next()),
            other => Err(Error::illegal_state(format!(
                "expected an object result, got {}",
                other.describe()
            ))),
        }
    }

    pub fn into_objects(self) -> Result<Vec<EntityRef>> {
        match self {
            QueryResult::Object(o) => Ok(o.into_iter().collect()),
            QueryResult::Objects(v) => Ok(v),
            other => Err(Error::illegal_state(format!(
                "expected object results, got {}",
                other.describe()
            ))),
        }
    }

    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            QueryResult::Rows(r) => Ok(r),
            other => Err(Error::illegal_state(format!(
                "expected rows, got {}",
                other.describe()
            ))),
        }
    }

    pub fn row_count(&self) -> Option<u64> {
        match self {
            QueryResult::RowCount(n) => Some(*n),
            _ => None,
        }
    }

    /// Object handles held by this result.
    pub fn objects(&self) -> Vec<EntityRef> {
        match self {
            QueryResult::Object(o) => o.iter().cloned().collect(),
            QueryResult::Objects(v) => v.clone(),
            QueryResult::Rows(_) | QueryResult::RowCount(_) => Vec::new(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            QueryResult::Object(_) => "a single object",
            QueryResult::Objects(_) => "a list of objects",
            QueryResult::Rows(_) => "rows",
            QueryResult::RowCount(_) => "a row count",
        }
    }
}

/// Answer of the early-return hook.
#[derive(Debug, Clone)]
pub enum EarlyReturn {
    /// The query is answered without touching the database.
    Found(QueryResult),
    /// The object is known not to exist.
    KnownAbsent,
    /// Proceed to the database.
    Unknown,
}

// ============================================================================
// Collaborators
// ============================================================================

/// Replaces the execution of a query entirely.
///
/// A redirector that wants to run the query itself should execute
/// [`DatabaseQuery::without_redirector`].
pub trait QueryRedirector: Send + Sync {
    fn invoke(
        &self,
        query: &DatabaseQuery,
        session: &dyn QuerySession,
        row: &TranslationRow,
    ) -> Result<QueryResult>;
}

/// The session a query executes against.
pub trait QuerySession {
    fn project(&self) -> &Project;

    fn dialect(&self) -> Dialect;

    fn profiler(&self) -> &QueryProfiler;

    /// Session-wide timeout, the last step of the timeout cascade.
    fn default_timeout(&self) -> QueryTimeout {
        QueryTimeout::Default
    }

    fn default_bind_all_parameters(&self) -> bool {
        true
    }

    fn default_cache_statement(&self) -> bool {
        false
    }

    fn default_retrieve_mode(&self) -> CacheRetrieveMode {
        CacheRetrieveMode::Use
    }

    fn default_store_mode(&self) -> CacheStoreMode {
        CacheStoreMode::Use
    }

    /// Whether this is a transactional working set rather than a shared
    /// session. Query-results caching only happens outside one.
    fn is_unit_of_work(&self) -> bool {
        false
    }

    /// Try to answer the query from memory.
    fn check_early_return(
        &self,
        query: &DatabaseQuery,
        row: &TranslationRow,
    ) -> Result<EarlyReturn>;

    /// Run a prepared call and turn its rows into the query's result.
    fn execute_call(
        &self,
        query: &DatabaseQuery,
        call: &PreparedCall,
        row: &TranslationRow,
    ) -> Result<QueryResult>;

    /// Vet a query-results cache hit; `None` discards it.
    fn validate_cached_result(
        &self,
        _query: &DatabaseQuery,
        result: QueryResult,
    ) -> Result<Option<QueryResult>> {
        Ok(Some(result))
    }
}

// ============================================================================
// Query-results cache
// ============================================================================

/// Argument values identifying one cached result.
#[derive(Debug, Clone)]
struct ArgumentKey(Vec<Value>);

impl PartialEq for ArgumentKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ArgumentKey {}

impl Hash for ArgumentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

#[derive(Debug, Default)]
struct ResultsCache {
    entries: HashMap<ArgumentKey, (QueryResult, u64)>,
    tick: u64,
}

impl ResultsCache {
    fn get(&mut self, key: &ArgumentKey) -> Option<QueryResult> {
        self.tick += 1;
        let tick = self.tick;
        let (result, used) = self.entries.get_mut(key)?;
        *used = tick;
        Some(result.clone())
    }

    fn insert(&mut self, key: ArgumentKey, result: QueryResult) {
        if !self.entries.contains_key(&key) && self.entries.len() >= QUERY_RESULTS_CACHE_SIZE {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.entries.insert(key, (result, self.tick));
    }
}

// ============================================================================
// DatabaseQuery
// ============================================================================

/// A query descriptor plus its prepared state.
pub struct DatabaseQuery {
    name: Option<String>,
    kind: QueryKind,
    reference_entity: Option<String>,
    arguments: Vec<QueryArgument>,
    mechanism: QueryMechanism,
    selection_criteria: Option<Expression>,
    ordering: Vec<OrderItem>,
    report_items: Vec<ReportItem>,
    group_by: Vec<Expression>,
    assignments: Vec<(Vec<String>, Expression)>,
    distinct: bool,
    max_rows: Option<usize>,
    first_result: usize,
    hint_string: Option<String>,
    lock_mode: LockMode,
    query_timeout: QueryTimeout,

    bind_all_parameters: TriState,
    cache_statement: TriState,
    retrieve_bypass_cache: TriState,
    store_bypass_cache: TriState,
    maintain_cache: TriState,

    cascade_policy: CascadePolicy,
    cache_usage: CacheUsage,
    refresh: bool,
    conform_results_in_unit_of_work: bool,
    read_only: bool,
    flush_mode: Option<FlushMode>,
    cache_query_results: bool,
    hints: BTreeMap<String, String>,
    redirector: Option<Arc<dyn QueryRedirector>>,

    /// False only for the descriptor's default queries.
    is_user_defined: bool,
    is_execution_clone: bool,
    translation_row: Option<TranslationRow>,
    results_key: Option<ArgumentKey>,

    prepared: RwLock<Option<Arc<PreparedCall>>>,
    monitor: Mutex<()>,
    custom: OnceLock<Arc<DatabaseQuery>>,
    results: Mutex<ResultsCache>,
}

impl DatabaseQuery {
    fn new(kind: QueryKind, reference_entity: Option<String>) -> Self {
        Self {
            name: None,
            kind,
            reference_entity,
            arguments: Vec::new(),
            mechanism: QueryMechanism::Expression,
            selection_criteria: None,
            ordering: Vec::new(),
            report_items: Vec::new(),
            group_by: Vec::new(),
            assignments: Vec::new(),
            distinct: false,
            max_rows: None,
            first_result: 0,
            hint_string: None,
            lock_mode: LockMode::None,
            query_timeout: QueryTimeout::Default,
            bind_all_parameters: TriState::Inherit,
            cache_statement: TriState::Inherit,
            retrieve_bypass_cache: TriState::Inherit,
            store_bypass_cache: TriState::Inherit,
            maintain_cache: TriState::Inherit,
            cascade_policy: CascadePolicy::default(),
            cache_usage: CacheUsage::UseDescriptorSetting,
            refresh: false,
            conform_results_in_unit_of_work: false,
            read_only: false,
            flush_mode: None,
            cache_query_results: false,
            hints: BTreeMap::new(),
            redirector: None,
            is_user_defined: true,
            is_execution_clone: false,
            translation_row: None,
            results_key: None,
            prepared: RwLock::new(None),
            monitor: Mutex::new(()),
            custom: OnceLock::new(),
            results: Mutex::new(ResultsCache::default()),
        }
    }

    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Read one object of `entity`. Set criteria to choose which.
    pub fn read_object(entity: impl Into<String>) -> Self {
        Self::new(QueryKind::ReadObject, Some(entity.into()))
    }

    /// The descriptor's default read-by-primary-key query.
    ///
    /// Arguments are named after the primary-key attributes.
    pub fn read_object_by_key(desc: &ClassDescriptor) -> Self {
        let mut query = Self::read_object(desc.entity_name());
        let mut criteria: Option<Expression> = None;
        for attr in desc.primary_key() {
            let term = Expression::attr(attr.clone()).equal(Expression::param(attr.clone()));
            criteria = Some(match criteria {
                Some(c) => c.and(term),
                None => term,
            });
            query.arguments.push(QueryArgument {
                name: attr.clone(),
                attribute_type: desc.attribute_type(attr),
            });
        }
        query.selection_criteria = criteria;
        query.is_user_defined = false;
        query
    }

    /// The descriptor's default read-all query; adding criteria makes it
    /// user-defined.
    pub fn read_all(entity: impl Into<String>) -> Self {
        let mut query = Self::new(QueryKind::ReadAll, Some(entity.into()));
        query.is_user_defined = false;
        query
    }

    pub fn report(entity: impl Into<String>) -> Self {
        Self::new(QueryKind::Report, Some(entity.into()))
    }

    pub fn update_all(entity: impl Into<String>) -> Self {
        Self::new(QueryKind::UpdateAll, Some(entity.into()))
    }

    pub fn delete_all(entity: impl Into<String>) -> Self {
        Self::new(QueryKind::DeleteAll, Some(entity.into()))
    }

    /// Rows from custom SQL. Arguments are taken from the call's markers.
    pub fn data_read(call: Call) -> Self {
        let mut query = Self::new(QueryKind::DataRead, None);
        query.set_call(call);
        query
    }

    /// A custom modifying statement.
    pub fn data_modify(call: Call) -> Self {
        let mut query = Self::new(QueryKind::DataModify, None);
        query.set_call(call);
        query
    }

    /// Object query running custom SQL whose columns map onto `entity`.
    pub fn read_all_with_call(entity: impl Into<String>, call: Call) -> Self {
        let mut query = Self::new(QueryKind::ReadAll, Some(entity.into()));
        query.set_call(call);
        query
    }

    /// Parse JPQL text into a query.
    ///
    /// `SELECT e` reads objects, select items make a report, `UPDATE` and
    /// `DELETE` are bulk modifications.
    pub fn jpql(text: &str) -> Result<Self> {
        let statement = jpql::parse(text)?;
        let kind = match statement.kind {
            JpqlStatementKind::Update => QueryKind::UpdateAll,
            JpqlStatementKind::Delete => QueryKind::DeleteAll,
            JpqlStatementKind::Select if statement.selects_entity() => QueryKind::ReadAll,
            JpqlStatementKind::Select => QueryKind::Report,
        };
        let mut query = Self::new(kind, Some(statement.entity.clone()));
        query.mechanism = QueryMechanism::Jpql(text.to_string());
        query.distinct = statement.distinct;
        query.selection_criteria = statement.selection;
        query.ordering = statement.order_by;
        query.group_by = statement.group_by;
        query.assignments = statement.assignments;
        for item in statement.select {
            match item {
                SelectItem::Item(item) => query.report_items.push(item),
                SelectItem::Entity => {}
            }
        }
        let mut names = statement.parameters;
        if names.iter().all(|n| n.parse::<usize>().is_ok()) {
            names.sort_by_key(|n| n.parse::<usize>().unwrap_or(usize::MAX));
        }
        query.arguments = names
            .into_iter()
            .map(|name| QueryArgument {
                name,
                attribute_type: None,
            })
            .collect();
        Ok(query)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for logs and error messages.
    pub fn display_name(&self) -> String {
        match (&self.name, &self.reference_entity) {
            (Some(name), _) => name.clone(),
            (None, Some(entity)) => format!("{:?}({})", self.kind, entity),
            (None, None) => format!("{:?}", self.kind),
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn reference_entity(&self) -> Option<&str> {
        self.reference_entity.as_deref()
    }

    pub fn arguments(&self) -> &[QueryArgument] {
        &self.arguments
    }

    pub fn mechanism(&self) -> &QueryMechanism {
        &self.mechanism
    }

    /// The JPQL text, for queries created from JPQL.
    pub fn jpql_text(&self) -> Option<&str> {
        match &self.mechanism {
            QueryMechanism::Jpql(text) => Some(text),
            _ => None,
        }
    }

    pub fn selection_criteria(&self) -> Option<&Expression> {
        self.selection_criteria.as_ref()
    }

    pub fn ordering(&self) -> &[OrderItem] {
        &self.ordering
    }

    pub fn report_items(&self) -> &[ReportItem] {
        &self.report_items
    }

    pub fn group_by(&self) -> &[Expression] {
        &self.group_by
    }

    pub fn assignments(&self) -> &[(Vec<String>, Expression)] {
        &self.assignments
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.max_rows
    }

    pub fn first_result(&self) -> usize {
        self.first_result
    }

    pub fn hint_string(&self) -> Option<&str> {
        self.hint_string.as_deref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn query_timeout(&self) -> QueryTimeout {
        self.query_timeout
    }

    pub fn should_bind_all_parameters(&self) -> TriState {
        self.bind_all_parameters
    }

    pub fn should_cache_statement(&self) -> TriState {
        self.cache_statement
    }

    pub fn should_retrieve_bypass_cache(&self) -> TriState {
        self.retrieve_bypass_cache
    }

    pub fn should_store_bypass_cache(&self) -> TriState {
        self.store_bypass_cache
    }

    pub fn should_maintain_cache(&self) -> TriState {
        self.maintain_cache
    }

    pub fn cascade_policy(&self) -> CascadePolicy {
        self.cascade_policy
    }

    pub fn cache_usage(&self) -> CacheUsage {
        self.cache_usage
    }

    pub fn should_refresh(&self) -> bool {
        self.refresh
    }

    pub fn should_conform_results_in_unit_of_work(&self) -> bool {
        self.conform_results_in_unit_of_work
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn flush_mode(&self) -> Option<FlushMode> {
        self.flush_mode
    }

    pub fn should_cache_query_results(&self) -> bool {
        self.cache_query_results
    }

    /// Hints applied to this query, by key.
    pub fn hints(&self) -> &BTreeMap<String, String> {
        &self.hints
    }

    pub fn has_redirector(&self) -> bool {
        self.redirector.is_some()
    }

    pub fn is_user_defined(&self) -> bool {
        self.is_user_defined
    }

    pub fn is_execution_clone(&self) -> bool {
        self.is_execution_clone
    }

    /// The arguments of the execution this clone belongs to.
    pub fn translation_row(&self) -> Option<&TranslationRow> {
        self.translation_row.as_ref()
    }

    pub fn is_prepared(&self) -> bool {
        sync::read(&self.prepared).is_some()
    }

    /// The compiled call, once prepared.
    pub fn prepared_call(&self) -> Option<Arc<PreparedCall>> {
        sync::read(&self.prepared).clone()
    }

    /// Number of entries in the query-results cache.
    pub fn cached_result_count(&self) -> usize {
        sync::lock(&self.results).entries.len()
    }

    // ------------------------------------------------------------------------
    // Mutators that change the generated SQL
    // ------------------------------------------------------------------------

    fn unprepare(&mut self) {
        *self
            .prepared
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.custom = OnceLock::new();
    }

    pub fn set_selection_criteria(&mut self, criteria: Expression) {
        self.selection_criteria = Some(criteria);
        self.is_user_defined = true;
        self.unprepare();
    }

    /// Run `call` instead of generated SQL. Arguments named by the call's
    /// markers are declared if missing.
    pub fn set_call(&mut self, call: Call) {
        for name in call.argument_names() {
            if !self.arguments.iter().any(|a| a.name == name) {
                self.arguments.push(QueryArgument {
                    name,
                    attribute_type: None,
                });
            }
        }
        self.set_query_mechanism(QueryMechanism::Call(call));
    }

    pub fn set_sql_statement(&mut self, statement: SqlStatement) {
        for name in statement.arguments() {
            if !self.arguments.iter().any(|a| &a.name == name) {
                self.arguments.push(QueryArgument {
                    name: name.clone(),
                    attribute_type: None,
                });
            }
        }
        self.set_query_mechanism(QueryMechanism::Statement(statement));
    }

    pub fn set_query_mechanism(&mut self, mechanism: QueryMechanism) {
        if !matches!(mechanism, QueryMechanism::Expression | QueryMechanism::Jpql(_)) {
            self.is_user_defined = true;
        }
        self.mechanism = mechanism;
        self.unprepare();
    }

    /// Verbatim text placed after `SELECT`, e.g. `/*+ INDEX(t0 EMP_IDX) */`.
    pub fn set_hint_string(&mut self, hint: Option<String>) {
        self.hint_string = hint;
        self.unprepare();
    }

    pub fn set_should_bind_all_parameters(&mut self, bind: TriState) {
        self.bind_all_parameters = bind;
        self.unprepare();
    }

    pub fn set_should_cache_statement(&mut self, cache: TriState) {
        self.cache_statement = cache;
        self.unprepare();
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
        self.unprepare();
    }

    pub fn set_query_timeout(&mut self, timeout: QueryTimeout) {
        self.query_timeout = timeout;
        self.unprepare();
    }

    pub fn set_max_rows(&mut self, max_rows: Option<usize>) {
        self.max_rows = max_rows;
        self.unprepare();
    }

    pub fn set_first_result(&mut self, first: usize) {
        self.first_result = first;
        self.unprepare();
    }

    pub fn set_distinct(&mut self, distinct: bool) {
        self.distinct = distinct;
        self.unprepare();
    }

    pub fn add_argument(&mut self, name: impl Into<String>, attribute_type: Option<AttributeType>) {
        let name = name.into();
        match self.arguments.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.attribute_type = attribute_type,
            None => self.arguments.push(QueryArgument {
                name,
                attribute_type,
            }),
        }
        self.unprepare();
    }

    pub fn add_ordering(&mut self, item: OrderItem) {
        self.ordering.push(item);
        self.unprepare();
    }

    pub fn add_report_item(&mut self, item: ReportItem) {
        self.report_items.push(item);
        self.unprepare();
    }

    pub fn add_group_by(&mut self, expr: Expression) {
        self.group_by.push(expr);
        self.unprepare();
    }

    pub fn add_assignment(&mut self, path: Vec<String>, value: Expression) {
        self.assignments.push((path, value));
        self.unprepare();
    }

    // ------------------------------------------------------------------------
    // Mutators that leave the prepared call alone
    // ------------------------------------------------------------------------

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn set_cascade_policy(&mut self, policy: CascadePolicy) {
        self.cascade_policy = policy;
    }

    pub fn set_cache_usage(&mut self, usage: CacheUsage) {
        self.cache_usage = usage;
    }

    pub fn set_should_retrieve_bypass_cache(&mut self, bypass: TriState) {
        self.retrieve_bypass_cache = bypass;
    }

    pub fn set_should_store_bypass_cache(&mut self, bypass: TriState) {
        self.store_bypass_cache = bypass;
    }

    pub fn set_should_maintain_cache(&mut self, maintain: TriState) {
        self.maintain_cache = maintain;
    }

    pub fn set_cache_retrieve_mode(&mut self, mode: CacheRetrieveMode) {
        self.retrieve_bypass_cache = TriState::from(mode == CacheRetrieveMode::Bypass);
    }

    /// `Refresh` stores like `Use` but forces a database read.
    pub fn set_cache_store_mode(&mut self, mode: CacheStoreMode) {
        self.refresh = mode == CacheStoreMode::Refresh;
        self.store_bypass_cache = TriState::from(mode == CacheStoreMode::Bypass);
    }

    pub fn set_refresh(&mut self, refresh: bool) {
        self.refresh = refresh;
    }

    pub fn set_conform_results_in_unit_of_work(&mut self, conform: bool) {
        self.conform_results_in_unit_of_work = conform;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn set_flush_mode(&mut self, mode: Option<FlushMode>) {
        self.flush_mode = mode;
    }

    /// Turning results caching off also drops what was cached.
    pub fn set_cache_query_results(&mut self, cache: bool) {
        self.cache_query_results = cache;
        if !cache {
            self.clear_query_results();
        }
    }

    pub fn clear_query_results(&self) {
        sync::lock(&self.results).entries.clear();
    }

    pub fn set_redirector(&mut self, redirector: Option<Arc<dyn QueryRedirector>>) {
        self.redirector = redirector;
    }

    pub(crate) fn record_hint(&mut self, key: &str, value: &str) {
        self.hints.insert(key.to_string(), value.to_string());
    }

    // ------------------------------------------------------------------------
    // Cache policy
    // ------------------------------------------------------------------------

    /// The retrieve mode of this query; an explicit query setting wins over
    /// the session default.
    pub fn retrieve_mode(&self, session: &dyn QuerySession) -> CacheRetrieveMode {
        if self.maintain_cache == TriState::False {
            return CacheRetrieveMode::Bypass;
        }
        match self.retrieve_bypass_cache.explicit() {
            Some(true) => CacheRetrieveMode::Bypass,
            Some(false) => CacheRetrieveMode::Use,
            None => session.default_retrieve_mode(),
        }
    }

    /// The store mode of this query; an explicit query setting wins over the
    /// session default.
    pub fn store_mode(&self, session: &dyn QuerySession) -> CacheStoreMode {
        if self.maintain_cache == TriState::False {
            return CacheStoreMode::Bypass;
        }
        if self.refresh {
            return CacheStoreMode::Refresh;
        }
        match self.store_bypass_cache.explicit() {
            Some(true) => CacheStoreMode::Bypass,
            Some(false) => CacheStoreMode::Use,
            None => session.default_store_mode(),
        }
    }

    /// How this execution consults the shared cache before the database.
    pub fn effective_cache_usage(&self, session: &dyn QuerySession) -> CacheUsage {
        if !self.kind.is_object_level_read_query()
            || self.retrieve_mode(session) == CacheRetrieveMode::Bypass
            || self.store_mode(session) == CacheStoreMode::Refresh
            || self.lock_mode != LockMode::None
        {
            return CacheUsage::DoNotCheckCache;
        }
        match (self.cache_usage, self.kind) {
            (CacheUsage::UseDescriptorSetting, QueryKind::ReadObject) => {
                CacheUsage::CheckCacheByPrimaryKey
            }
            (CacheUsage::UseDescriptorSetting, _) => CacheUsage::DoNotCheckCache,
            (usage, _) => usage,
        }
    }

    fn caches_results(&self, session: &dyn QuerySession) -> bool {
        self.cache_query_results
            && self.kind.is_read_query()
            && !session.is_unit_of_work()
            && self.retrieve_mode(session) == CacheRetrieveMode::Use
            && self.store_mode(session) == CacheStoreMode::Use
    }

    // ------------------------------------------------------------------------
    // Custom query substitution
    // ------------------------------------------------------------------------

    /// Descriptor SQL replacing this query, for default queries only.
    fn custom_override<'p>(&self, project: &'p Project) -> Option<&'p str> {
        if self.is_user_defined {
            return None;
        }
        let desc = project.descriptor(self.reference_entity.as_deref()?)?;
        match self.kind {
            QueryKind::ReadObject => desc.overrides().read_object.as_deref(),
            QueryKind::ReadAll if self.selection_criteria.is_none() => {
                desc.overrides().read_all.as_deref()
            }
            _ => None,
        }
    }

    /// The query that runs in place of this one, built once per instance.
    pub fn custom_query(&self, project: &Project) -> Option<Arc<DatabaseQuery>> {
        let sql = self.custom_override(project)?;
        let custom = self.custom.get_or_init(|| {
            let mut custom = self.clone();
            custom.set_call(Call::sql(sql));
            Arc::new(custom)
        });
        Some(Arc::clone(custom))
    }

    // ------------------------------------------------------------------------
    // Preparation
    // ------------------------------------------------------------------------

    /// Compile this query, at most once per instance.
    ///
    /// Returns `None` when a descriptor custom query runs instead. `force`
    /// recompiles even when already prepared.
    pub fn check_prepare(
        &self,
        session: &dyn QuerySession,
        row: &TranslationRow,
        force: bool,
    ) -> Result<Option<Arc<PreparedCall>>> {
        let project = session.project();
        if self.custom_override(project).is_some() {
            return Ok(None);
        }
        if !force {
            if let Some(call) = sync::read(&self.prepared).as_ref() {
                return Ok(Some(Arc::clone(call)));
            }
        }

        let name = self.display_name();
        session.profiler().time_prepare(&name, || {
            let _guard = sync::lock(&self.monitor);
            if self.custom_override(project).is_some() {
                return Ok(None);
            }
            if !force {
                if let Some(call) = sync::read(&self.prepared).as_ref() {
                    return Ok(Some(Arc::clone(call)));
                }
            }
            tracing::trace!(query = %name, arguments = row.len(), "Preparing query");
            let call = Arc::new(self.prepare(session)?);
            *sync::write(&self.prepared) = Some(Arc::clone(&call));
            Ok(Some(call))
        })
    }

    fn prepare(&self, session: &dyn QuerySession) -> Result<PreparedCall> {
        let project = session.project();
        if self.lock_mode != LockMode::None && !self.kind.is_read_query() {
            return Err(Error::illegal_state(format!(
                "lock mode {:?} is only valid for read queries, not '{}'",
                self.lock_mode,
                self.display_name()
            )));
        }
        let descriptor = self
            .reference_entity
            .as_deref()
            .and_then(|e| project.descriptor(e));
        let timeout = self
            .query_timeout
            .or(descriptor.map_or(QueryTimeout::Default, ClassDescriptor::timeout))
            .or(session.default_timeout());
        let bind_all = self
            .bind_all_parameters
            .resolve(session.default_bind_all_parameters());

        let built = mechanism::build_call(self, project, session.dialect(), bind_all)?;
        let argument_fields = mechanism::argument_fields(self, project, built.custom_selection);
        session.profiler().record_prepare();

        tracing::debug!(
            query = %self.display_name(),
            kind = ?self.kind,
            mechanism = self.mechanism.name(),
            timeout_ms = timeout.as_duration().map(|d| d.as_millis() as u64),
            custom_selection = built.custom_selection,
            sql = %built.sql,
            "Prepared query"
        );

        Ok(PreparedCall {
            sql: built.sql,
            parameters: built.parameters,
            argument_fields,
            timeout: timeout.as_duration(),
            result: built.result,
            custom_selection: built.custom_selection,
            lock_mode: self.lock_mode,
            cache_statement: self
                .cache_statement
                .resolve(session.default_cache_statement()),
        })
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Map positional argument values onto the declared arguments.
    pub fn translate(&self, args: &[Value]) -> Result<TranslationRow> {
        if args.len() != self.arguments.len() {
            return Err(Error::illegal_argument(format!(
                "query '{}' expects {} arguments, got {}",
                self.display_name(),
                self.arguments.len(),
                args.len()
            )));
        }
        Ok(self
            .arguments
            .iter()
            .zip(args)
            .map(|(arg, value)| (arg.name.clone(), value.clone()))
            .collect())
    }

    fn validate_arguments(&self, row: &TranslationRow) -> Result<()> {
        for arg in &self.arguments {
            let value = row.get(&arg.name).ok_or_else(|| {
                Error::illegal_argument(format!(
                    "no value supplied for argument '{}' of query '{}'",
                    arg.name,
                    self.display_name()
                ))
            })?;
            if let Some(ty) = arg.attribute_type {
                if !ty.accepts(value) {
                    return Err(Error::illegal_argument(format!(
                        "argument '{}' of query '{}' expects {:?}, got {}",
                        arg.name,
                        self.display_name(),
                        ty,
                        value.type_name()
                    )));
                }
            }
        }
        if let Some((name, _)) = row
            .iter()
            .find(|(name, _)| !self.arguments.iter().any(|a| a.name == *name))
        {
            return Err(Error::illegal_argument(format!(
                "query '{}' has no argument named '{}'",
                self.display_name(),
                name
            )));
        }
        Ok(())
    }

    /// Execute with positional argument values.
    pub fn execute(&self, session: &dyn QuerySession, args: &[Value]) -> Result<QueryResult> {
        let row = self.translate(args)?;
        self.execute_with_row(session, &row)
    }

    /// Execute with a translation row keyed by argument name.
    #[tracing::instrument(level = "debug", skip_all, fields(query = %self.display_name()))]
    pub fn execute_with_row(
        &self,
        session: &dyn QuerySession,
        row: &TranslationRow,
    ) -> Result<QueryResult> {
        self.validate_arguments(row)?;

        if let Some(redirector) = &self.redirector {
            tracing::debug!("Redirecting query");
            return redirector.invoke(self, session, row);
        }

        let profiler = session.profiler();
        let names: Vec<String> = self.arguments.iter().map(|a| a.name.clone()).collect();
        let results_key = self
            .caches_results(session)
            .then(|| ArgumentKey(row.key_for(&names)));
        if let Some(key) = &results_key {
            let hit = sync::lock(&self.results).get(key);
            if let Some(hit) = hit {
                if let Some(result) = session.validate_cached_result(self, hit)? {
                    profiler.record_results_cache_hit();
                    tracing::debug!("Answered from query-results cache");
                    return Ok(result);
                }
            }
        }

        match session.check_early_return(self, row)? {
            EarlyReturn::Found(result) => {
                profiler.record_early_return();
                return Ok(result);
            }
            EarlyReturn::KnownAbsent => {
                profiler.record_early_return();
                return Ok(self.empty_result());
            }
            EarlyReturn::Unknown => {}
        }

        if let Some(custom) = self.custom_query(session.project()) {
            tracing::debug!("Running descriptor custom query");
            return custom.execute_with_row(session, row);
        }

        let call = self.check_prepare(session, row, false)?.ok_or_else(|| {
            Error::illegal_state(format!(
                "query '{}' could not be prepared",
                self.display_name()
            ))
        })?;

        profiler.record_execution();
        if self.is_execution_clone {
            profiler.record_database_call();
            return session.execute_call(self, &call, row);
        }

        let mut clone = self.clone_for_execution();
        clone.translation_row = Some(row.clone());
        clone.results_key = results_key;
        profiler.record_database_call();
        let result = session.execute_call(&clone, &call, row)?;
        self.clone_completed(&clone, &result);
        Ok(result)
    }

    /// A safe-to-mutate copy sharing the prepared call.
    pub fn clone_for_execution(&self) -> DatabaseQuery {
        let mut clone = self.clone();
        clone.is_execution_clone = true;
        clone
    }

    /// Copy without the redirector, for redirectors that run the query.
    pub fn without_redirector(&self) -> DatabaseQuery {
        let mut clone = self.clone();
        clone.redirector = None;
        clone
    }

    /// Harvest state from a finished execution clone.
    pub fn clone_completed(&self, clone: &DatabaseQuery, result: &QueryResult) {
        if let Some(key) = &clone.results_key {
            sync::lock(&self.results).insert(key.clone(), result.clone());
        }
    }

    /// Result for a query the early-return hook knows matches nothing.
    pub fn empty_result(&self) -> QueryResult {
        match self.kind {
            QueryKind::ReadObject => QueryResult::Object(None),
            QueryKind::ReadAll => QueryResult::Objects(Vec::new()),
            QueryKind::Report | QueryKind::DataRead => QueryResult::Rows(Vec::new()),
            QueryKind::DataModify | QueryKind::UpdateAll | QueryKind::DeleteAll => {
                QueryResult::RowCount(0)
            }
        }
    }
}

impl Clone for DatabaseQuery {
    fn clone(&self) -> Self {
        let custom = OnceLock::new();
        if let Some(existing) = self.custom.get() {
            let _ = custom.set(Arc::clone(existing));
        }
        Self {
            name: self.name.clone(),
            kind: self.kind,
            reference_entity: self.reference_entity.clone(),
            arguments: self.arguments.clone(),
            mechanism: self.mechanism.clone(),
            selection_criteria: self.selection_criteria.clone(),
            ordering: self.ordering.clone(),
            report_items: self.report_items.clone(),
            group_by: self.group_by.clone(),
            assignments: self.assignments.clone(),
            distinct: self.distinct,
            max_rows: self.max_rows,
            first_result: self.first_result,
            hint_string: self.hint_string.clone(),
            lock_mode: self.lock_mode,
            query_timeout: self.query_timeout,
            bind_all_parameters: self.bind_all_parameters,
            cache_statement: self.cache_statement,
            retrieve_bypass_cache: self.retrieve_bypass_cache,
            store_bypass_cache: self.store_bypass_cache,
            maintain_cache: self.maintain_cache,
            cascade_policy: self.cascade_policy,
            cache_usage: self.cache_usage,
            refresh: self.refresh,
            conform_results_in_unit_of_work: self.conform_results_in_unit_of_work,
            read_only: self.read_only,
            flush_mode: self.flush_mode,
            cache_query_results: self.cache_query_results,
            hints: self.hints.clone(),
            redirector: self.redirector.clone(),
            is_user_defined: self.is_user_defined,
            is_execution_clone: self.is_execution_clone,
            translation_row: self.translation_row.clone(),
            results_key: self.results_key.clone(),
            prepared: RwLock::new(sync::read(&self.prepared).clone()),
            monitor: Mutex::new(()),
            custom,
            results: Mutex::new(ResultsCache::default()),
        }
    }
}

impl fmt::Debug for DatabaseQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseQuery")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("reference_entity", &self.reference_entity)
            .field("mechanism", &self.mechanism.name())
            .field("arguments", &self.arguments)
            .field("prepared", &self.is_prepared())
            .field("execution_clone", &self.is_execution_clone)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallResult;
    use persist_core::{ClassDescriptor, Entity, entity_ref};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockSession {
        project: Project,
        profiler: QueryProfiler,
        timeout: QueryTimeout,
        early: Mutex<Option<EarlyReturn>>,
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        unit_of_work: bool,
    }

    impl MockSession {
        fn new() -> Self {
            let mut project = Project::new()
                .with(
                    ClassDescriptor::entity("Employee", "EMPLOYEE")
                        .id("id", "EMP_ID", AttributeType::Integer)
                        .direct("name", "NAME", AttributeType::Text)
                        .query_timeout(QueryTimeout::seconds(30)),
                )
                .with(
                    ClassDescriptor::entity("Legacy", "LEGACY")
                        .id("id", "ID", AttributeType::Integer)
                        .custom_read_object_sql("SELECT * FROM LEGACY_V WHERE ID = #id"),
                );
            project.initialize().unwrap();
            Self {
                project,
                profiler: QueryProfiler::new(),
                timeout: QueryTimeout::seconds(5),
                early: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                unit_of_work: false,
            }
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl QuerySession for MockSession {
        fn project(&self) -> &Project {
            &self.project
        }

        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn profiler(&self) -> &QueryProfiler {
            &self.profiler
        }

        fn default_timeout(&self) -> QueryTimeout {
            self.timeout
        }

        fn is_unit_of_work(&self) -> bool {
            self.unit_of_work
        }

        fn check_early_return(
            &self,
            _query: &DatabaseQuery,
            _row: &TranslationRow,
        ) -> Result<EarlyReturn> {
            Ok(self.early.lock().unwrap().clone().unwrap_or(EarlyReturn::Unknown))
        }

        fn execute_call(
            &self,
            query: &DatabaseQuery,
            call: &PreparedCall,
            row: &TranslationRow,
        ) -> Result<QueryResult> {
            assert!(query.is_execution_clone() || query.translation_row().is_none());
            let bound = call.bind(row)?;
            self.calls
                .lock()
                .unwrap()
                .push((call.sql.clone(), bound.clone()));
            if call.result == CallResult::RowCount {
                return Ok(QueryResult::RowCount(1));
            }
            Ok(QueryResult::Rows(vec![Row::new(
                (0..bound.len()).map(|i| format!("p{}", i)).collect(),
                bound,
            )]))
        }
    }

    fn by_name() -> DatabaseQuery {
        let mut query = DatabaseQuery::read_all("Employee");
        query.set_selection_criteria(Expression::attr("name").equal(Expression::param("name")));
        query.add_argument("name", Some(AttributeType::Text));
        query
    }

    #[test]
    fn prepare_runs_once_across_threads() {
        let session = MockSession::new();
        let query = Arc::new(by_name());
        let barrier = Barrier::new(8);
        let calls: Vec<Arc<PreparedCall>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        query
                            .check_prepare(&session, &TranslationRow::new(), false)
                            .unwrap()
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(session.profiler.stats().prepares, 1);
        assert!(calls.iter().all(|c| Arc::ptr_eq(c, &calls[0])));
        assert!(query.is_prepared());
    }

    #[test]
    fn timeout_cascades_query_descriptor_session() {
        let session = MockSession::new();
        let row = TranslationRow::new().with("name", "x");

        let query = by_name();
        let call = query.check_prepare(&session, &row, false).unwrap().unwrap();
        assert_eq!(call.timeout, Some(Duration::from_secs(30)));

        let mut query = by_name();
        query.set_query_timeout(QueryTimeout::NoTimeout);
        let call = query.check_prepare(&session, &row, false).unwrap().unwrap();
        assert_eq!(call.timeout, None);

        let mut query = DatabaseQuery::data_read(Call::sql("SELECT 1"));
        query.set_query_timeout(QueryTimeout::Default);
        let call = query.check_prepare(&session, &row, false).unwrap().unwrap();
        assert_eq!(call.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn sql_affecting_mutators_unprepare() {
        let session = MockSession::new();
        let row = TranslationRow::new();
        let mutations: Vec<Box<dyn Fn(&mut DatabaseQuery)>> = vec![
            Box::new(|q| q.set_selection_criteria(Expression::attr("id").equal(1i64))),
            Box::new(|q| q.set_call(Call::sql("SELECT * FROM EMPLOYEE"))),
            Box::new(|q| q.set_hint_string(Some("/*+ FIRST_ROWS */".into()))),
            Box::new(|q| q.set_should_bind_all_parameters(TriState::False)),
            Box::new(|q| q.set_should_cache_statement(TriState::True)),
            Box::new(|q| q.set_query_mechanism(QueryMechanism::Expression)),
        ];
        for mutate in mutations {
            let mut query = DatabaseQuery::read_all("Employee");
            query.check_prepare(&session, &row, false).unwrap();
            assert!(query.is_prepared());
            mutate(&mut query);
            assert!(!query.is_prepared());
        }

        let mut query = DatabaseQuery::read_all("Employee");
        query.check_prepare(&session, &row, false).unwrap();
        query.set_cache_store_mode(CacheStoreMode::Bypass);
        assert!(query.is_prepared());
    }

    #[test]
    fn force_recompiles() {
        let session = MockSession::new();
        let query = DatabaseQuery::read_all("Employee");
        let row = TranslationRow::new();
        let first = query.check_prepare(&session, &row, false).unwrap().unwrap();
        let second = query.check_prepare(&session, &row, true).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.sql, second.sql);
        assert_eq!(session.profiler.stats().prepares, 2);
    }

    #[test]
    fn concurrent_executions_keep_their_own_arguments() {
        let session = MockSession::new();
        let query = Arc::new(by_name());
        let mismatches = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for t in 0..8 {
                let query = &query;
                let session = &session;
                let mismatches = &mismatches;
                s.spawn(move || {
                    for i in 0..50 {
                        let name = format!("emp-{}-{}", t, i);
                        let rows = query
                            .execute(session, &[Value::Text(name.clone())])
                            .unwrap()
                            .into_rows()
                            .unwrap();
                        if rows[0].get(0) != Some(&Value::Text(name)) {
                            mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(mismatches.load(Ordering::Relaxed), 0);
        assert_eq!(session.profiler.stats().prepares, 1);
        assert!(query.translation_row().is_none());
        assert!(!query.is_execution_clone());
    }

    #[test]
    fn argument_count_and_type_are_checked() {
        let session = MockSession::new();
        let query = by_name();
        let err = query.execute(&session, &[]).unwrap_err();
        assert_eq!(err.usage_kind(), Some(persist_core::UsageErrorKind::IllegalArgument));
        let err = query.execute(&session, &[Value::BigInt(3)]).unwrap_err();
        assert_eq!(err.usage_kind(), Some(persist_core::UsageErrorKind::IllegalArgument));
        let err = query
            .execute_with_row(&session, &TranslationRow::new().with("name", "a").with("x", 1i64))
            .unwrap_err();
        assert!(err.to_string().contains("no argument named 'x'"));
        assert!(session.calls().is_empty());
    }

    #[test]
    fn early_return_skips_the_database() {
        let session = MockSession::new();
        let cached = entity_ref(Entity::new("Employee").with("id", 1i64));
        *session.early.lock().unwrap() = Some(EarlyReturn::Found(QueryResult::Object(Some(
            Arc::clone(&cached),
        ))));
        let desc = session.project.descriptor("Employee").unwrap().clone();
        let query = DatabaseQuery::read_object_by_key(&desc);
        let found = query
            .execute(&session, &[Value::BigInt(1)])
            .unwrap()
            .into_object()
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&found, &cached));

        *session.early.lock().unwrap() = Some(EarlyReturn::KnownAbsent);
        let result = query.execute(&session, &[Value::BigInt(2)]).unwrap();
        assert!(matches!(result, QueryResult::Object(None)));
        assert!(session.calls().is_empty());
        assert!(!query.is_prepared());
        assert_eq!(session.profiler.stats().early_returns, 2);
    }

    #[test]
    fn default_query_runs_descriptor_custom_sql() {
        let session = MockSession::new();
        let desc = session.project.descriptor("Legacy").unwrap().clone();
        let query = DatabaseQuery::read_object_by_key(&desc);
        let row = TranslationRow::new().with("id", 4i64);
        assert!(query.check_prepare(&session, &row, false).unwrap().is_none());

        query.execute_with_row(&session, &row).unwrap();
        let calls = session.calls();
        assert_eq!(calls[0].0, "SELECT * FROM LEGACY_V WHERE ID = ?1");
        assert_eq!(calls[0].1, vec![Value::BigInt(4)]);
        assert!(!query.is_prepared());
        let custom = query.custom_query(&session.project).unwrap();
        assert!(custom.is_prepared());
        assert!(custom.is_user_defined());

        let mut user = DatabaseQuery::read_object("Legacy");
        user.set_selection_criteria(Expression::attr("id").equal(4));
        assert!(user.custom_query(&session.project).is_none());
    }

    #[test]
    fn execution_clone_is_not_cloned_again() {
        let session = MockSession::new();
        let clone = by_name().clone_for_execution();
        assert!(clone.is_execution_clone());
        clone.execute(&session, &[Value::from("a")]).unwrap();
        assert_eq!(session.calls().len(), 1);
    }

    #[test]
    fn results_cache_is_harvested_from_the_clone() {
        let session = MockSession::new();
        let mut query = by_name();
        query.set_cache_query_results(true);
        query.execute(&session, &[Value::from("a")]).unwrap();
        query.execute(&session, &[Value::from("a")]).unwrap();
        query.execute(&session, &[Value::from("b")]).unwrap();
        assert_eq!(session.calls().len(), 2);
        assert_eq!(query.cached_result_count(), 2);
        assert_eq!(session.profiler.stats().results_cache_hits, 1);

        let mut bypass = by_name();
        bypass.set_cache_query_results(true);
        bypass.set_cache_retrieve_mode(CacheRetrieveMode::Bypass);
        bypass.execute(&session, &[Value::from("a")]).unwrap();
        assert_eq!(bypass.cached_result_count(), 0);
    }

    #[test]
    fn redirector_replaces_execution() {
        struct Fixed;
        impl QueryRedirector for Fixed {
            fn invoke(
                &self,
                query: &DatabaseQuery,
                session: &dyn QuerySession,
                row: &TranslationRow,
            ) -> Result<QueryResult> {
                let plain = query.without_redirector();
                assert!(!plain.has_redirector());
                plain.execute_with_row(session, row)?;
                Ok(QueryResult::RowCount(42))
            }
        }
        let session = MockSession::new();
        let mut query = by_name();
        query.set_redirector(Some(Arc::new(Fixed)));
        let result = query.execute(&session, &[Value::from("a")]).unwrap();
        assert_eq!(result.row_count(), Some(42));
        assert_eq!(session.calls().len(), 1);
    }

    #[test]
    fn store_and_retrieve_modes_resolve_against_session() {
        let session = MockSession::new();
        let mut query = DatabaseQuery::read_all("Employee");
        assert_eq!(query.retrieve_mode(&session), CacheRetrieveMode::Use);
        query.set_cache_store_mode(CacheStoreMode::Refresh);
        assert_eq!(query.store_mode(&session), CacheStoreMode::Refresh);
        assert_eq!(query.effective_cache_usage(&session), CacheUsage::DoNotCheckCache);
        query.set_cache_store_mode(CacheStoreMode::Bypass);
        assert_eq!(query.store_mode(&session), CacheStoreMode::Bypass);
        query.set_should_maintain_cache(TriState::False);
        assert_eq!(query.retrieve_mode(&session), CacheRetrieveMode::Bypass);

        let desc = session.project.descriptor("Employee").unwrap().clone();
        let by_key = DatabaseQuery::read_object_by_key(&desc);
        assert_eq!(
            by_key.effective_cache_usage(&session),
            CacheUsage::CheckCacheByPrimaryKey
        );
    }

    #[test]
    fn jpql_builds_the_matching_kind() {
        let q = DatabaseQuery::jpql("SELECT e FROM Employee e WHERE e.name = ?2 OR e.id = ?1").unwrap();
        assert_eq!(q.kind(), QueryKind::ReadAll);
        assert!(q.is_user_defined());
        assert!(q.selection_criteria().is_some());
        let names: Vec<&str> = q.arguments().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["1", "2"]);

        let q = DatabaseQuery::jpql("SELECT COUNT(e) FROM Employee e").unwrap();
        assert_eq!(q.kind(), QueryKind::Report);
        let q = DatabaseQuery::jpql("DELETE FROM Employee e WHERE e.id = 1").unwrap();
        assert!(q.kind().is_modify_all_query());
        assert!(DatabaseQuery::jpql("SELECT e, COUNT(e) FROM Employee e").is_err());
    }

    #[test]
    fn lock_mode_on_bulk_update_is_rejected() {
        let session = MockSession::new();
        let mut query = DatabaseQuery::delete_all("Employee");
        query.set_lock_mode(LockMode::Pessimistic);
        let err = query
            .check_prepare(&session, &TranslationRow::new(), false)
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(persist_core::UsageErrorKind::IllegalState));
    }
}
