//! Textual query hints.
//!
//! Hints arrive as string key/value pairs from the persistence context API
//! and from persistence-unit properties. Each recognized key maps onto a
//! query setting; unknown keys are logged and ignored, malformed values are
//! rejected.

use crate::options::{CacheRetrieveMode, CacheStoreMode, CacheUsage, CascadePolicy, FlushMode};
use crate::query::DatabaseQuery;
use persist_core::{Error, LockMode, QueryTimeout, Result, TriState};
use std::collections::HashMap;

pub const CACHE_RETRIEVE_MODE: &str = "javax.persistence.cache.retrieveMode";
pub const JAKARTA_CACHE_RETRIEVE_MODE: &str = "jakarta.persistence.cache.retrieveMode";
pub const CACHE_STORE_MODE: &str = "javax.persistence.cache.storeMode";
pub const JAKARTA_CACHE_STORE_MODE: &str = "jakarta.persistence.cache.storeMode";
/// Query timeout in milliseconds.
pub const QUERY_TIMEOUT: &str = "javax.persistence.query.timeout";
pub const JAKARTA_QUERY_TIMEOUT: &str = "jakarta.persistence.query.timeout";
/// A [`CacheUsage`] name, or `ConformResultsInUnitOfWork`.
pub const CACHE_USAGE: &str = "persist.cache-usage";
pub const READ_ONLY: &str = "persist.read-only";
/// Verbatim text placed after `SELECT`.
pub const HINT: &str = "persist.sql.hint";
pub const QUERY_RESULTS_CACHE: &str = "persist.query-results-cache";
/// `NoLock`, `Lock` or `LockNoWait`.
pub const PESSIMISTIC_LOCK: &str = "persist.pessimistic-lock";
pub const FLUSH_MODE: &str = "persist.flush-mode";
pub const MAX_ROWS: &str = "persist.jdbc.max-rows";
pub const FIRST_RESULT: &str = "persist.jdbc.first-result";
pub const BIND_PARAMETERS: &str = "persist.jdbc.bind-parameters";
pub const CACHE_STATEMENT: &str = "persist.jdbc.cache-statement";
pub const REFRESH: &str = "persist.refresh";
pub const REFRESH_CASCADE: &str = "persist.refresh.cascade";

/// Apply one hint to `query`.
pub fn apply_hint(query: &mut DatabaseQuery, key: &str, value: &str) -> Result<()> {
    let value = value.trim();
    match key {
        CACHE_RETRIEVE_MODE | JAKARTA_CACHE_RETRIEVE_MODE => {
            let mode = CacheRetrieveMode::parse(value).ok_or_else(|| invalid(key, value))?;
            query.set_cache_retrieve_mode(mode);
        }
        CACHE_STORE_MODE | JAKARTA_CACHE_STORE_MODE => {
            let mode = CacheStoreMode::parse(value).ok_or_else(|| invalid(key, value))?;
            query.set_cache_store_mode(mode);
        }
        QUERY_TIMEOUT | JAKARTA_QUERY_TIMEOUT => {
            let ms: u64 = value.parse().map_err(|_| invalid(key, value))?;
            query.set_query_timeout(if ms == 0 {
                QueryTimeout::NoTimeout
            } else {
                QueryTimeout::millis(ms)
            });
        }
        CACHE_USAGE => {
            if value.eq_ignore_ascii_case("ConformResultsInUnitOfWork") {
                query.set_conform_results_in_unit_of_work(true);
            } else {
                let usage = CacheUsage::parse(value).ok_or_else(|| invalid(key, value))?;
                query.set_cache_usage(usage);
            }
        }
        READ_ONLY => query.set_read_only(parse_bool(key, value)?),
        HINT => query.set_hint_string((!value.is_empty()).then(|| value.to_string())),
        QUERY_RESULTS_CACHE => query.set_cache_query_results(parse_bool(key, value)?),
        PESSIMISTIC_LOCK => {
            let mode = match value.to_ascii_lowercase().as_str() {
                "nolock" => LockMode::None,
                "lock" => LockMode::Pessimistic,
                "locknowait" => LockMode::PessimisticNoWait,
                _ => return Err(invalid(key, value)),
            };
            query.set_lock_mode(mode);
        }
        FLUSH_MODE => {
            let mode = FlushMode::parse(value).ok_or_else(|| invalid(key, value))?;
            query.set_flush_mode(Some(mode));
        }
        MAX_ROWS => {
            let n: usize = value.parse().map_err(|_| invalid(key, value))?;
            query.set_max_rows((n > 0).then_some(n));
        }
        FIRST_RESULT => {
            let n: usize = value.parse().map_err(|_| invalid(key, value))?;
            query.set_first_result(n);
        }
        BIND_PARAMETERS => {
            query.set_should_bind_all_parameters(TriState::from(parse_bool(key, value)?));
        }
        CACHE_STATEMENT => {
            query.set_should_cache_statement(TriState::from(parse_bool(key, value)?));
        }
        REFRESH => query.set_refresh(parse_bool(key, value)?),
        REFRESH_CASCADE => {
            let policy = CascadePolicy::parse(value).ok_or_else(|| invalid(key, value))?;
            query.set_cascade_policy(policy);
        }
        _ => {
            tracing::debug!(hint = key, value = value, "Ignoring unknown query hint");
            return Ok(());
        }
    }
    query.record_hint(key, value);
    Ok(())
}

/// Apply every hint in `hints`. Keys are applied in sorted order so the
/// outcome does not depend on map iteration order.
pub fn apply_hints(query: &mut DatabaseQuery, hints: &HashMap<String, String>) -> Result<()> {
    let mut keys: Vec<&String> = hints.keys().collect();
    keys.sort();
    for key in keys {
        apply_hint(query, key, &hints[key])?;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::illegal_argument(format!("invalid value '{value}' for query hint '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::UsageErrorKind;
    use std::time::Duration;

    #[test]
    fn cache_mode_hints() {
        let mut query = DatabaseQuery::read_all("Employee");
        apply_hint(&mut query, CACHE_RETRIEVE_MODE, "BYPASS").unwrap();
        apply_hint(&mut query, JAKARTA_CACHE_STORE_MODE, "refresh").unwrap();
        assert_eq!(query.should_retrieve_bypass_cache(), TriState::True);
        assert!(query.should_refresh());
        assert_eq!(query.hints().len(), 2);
    }

    #[test]
    fn timeout_hint_is_milliseconds() {
        let mut query = DatabaseQuery::read_all("Employee");
        apply_hint(&mut query, QUERY_TIMEOUT, "1500").unwrap();
        assert_eq!(
            query.query_timeout().as_duration(),
            Some(Duration::from_millis(1500))
        );
        apply_hint(&mut query, QUERY_TIMEOUT, "0").unwrap();
        assert_eq!(query.query_timeout(), QueryTimeout::NoTimeout);
    }

    #[test]
    fn lock_and_paging_hints() {
        let mut query = DatabaseQuery::read_all("Employee");
        apply_hint(&mut query, PESSIMISTIC_LOCK, "LockNoWait").unwrap();
        apply_hint(&mut query, MAX_ROWS, "10").unwrap();
        apply_hint(&mut query, FIRST_RESULT, "20").unwrap();
        assert_eq!(query.lock_mode(), LockMode::PessimisticNoWait);
        assert_eq!(query.max_rows(), Some(10));
        assert_eq!(query.first_result(), 20);
    }

    #[test]
    fn conform_is_a_cache_usage_value() {
        let mut query = DatabaseQuery::read_all("Employee");
        apply_hint(&mut query, CACHE_USAGE, "ConformResultsInUnitOfWork").unwrap();
        assert!(query.should_conform_results_in_unit_of_work());
        apply_hint(&mut query, CACHE_USAGE, "CheckCacheOnly").unwrap();
        assert_eq!(query.cache_usage(), CacheUsage::CheckCacheOnly);
    }

    #[test]
    fn bad_values_are_rejected_and_unknown_keys_ignored() {
        let mut query = DatabaseQuery::read_all("Employee");
        let err = apply_hint(&mut query, READ_ONLY, "maybe").unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::IllegalArgument));
        apply_hint(&mut query, "vendor.specific", "x").unwrap();
        assert!(query.hints().is_empty());
    }

    #[test]
    fn apply_hints_sets_every_key() {
        let mut query = DatabaseQuery::read_all("Employee");
        let hints = HashMap::from([
            (READ_ONLY.to_string(), "true".to_string()),
            (FLUSH_MODE.to_string(), "COMMIT".to_string()),
        ]);
        apply_hints(&mut query, &hints).unwrap();
        assert!(query.is_read_only());
        assert_eq!(query.flush_mode(), Some(FlushMode::Commit));
    }
}
