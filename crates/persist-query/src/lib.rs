//! Queries for the persist object-relational layer.
//!
//! - `DatabaseQuery` with prepare-once, execution clones and early returns
//! - `Expression` criteria that render SQL and conform in memory
//! - JPQL parsing into the same query model
//! - custom SQL calls, stored procedures and textual hints

pub mod cache;
pub mod call;
pub mod expr;
pub mod hints;
pub mod jpql;
pub mod mechanism;
pub mod options;
pub mod profile;
pub mod query;

pub use cache::ParseCache;
pub use call::{
    ArgumentField, Call, CallResult, ParameterSource, PreparedCall, SqlCall, StoredProcedureCall,
    TranslationRow,
};
pub use expr::{
    AggregateFunction, BinaryOp, ConformContext, Expression, OrderItem, Parameter, ReportItem,
    ResolvedColumn, SqlContext, resolve_column,
};
pub use hints::{apply_hint, apply_hints};
pub use jpql::{JpqlStatement, JpqlStatementKind, SelectItem};
pub use mechanism::{QueryMechanism, SqlStatement};
pub use options::{CacheRetrieveMode, CacheStoreMode, CacheUsage, CascadePolicy, FlushMode};
pub use profile::{ProfileStats, QueryProfiler};
pub use query::{
    DatabaseQuery, EarlyReturn, QUERY_RESULTS_CACHE_SIZE, QueryArgument, QueryKind,
    QueryRedirector, QueryResult, QuerySession,
};
