//! Session configuration and persistence-unit properties.

use persist_core::{Error, QueryTimeout, Result};
use persist_query::{CacheRetrieveMode, CacheStoreMode, FlushMode, hints};
use std::collections::HashMap;

/// Property selecting the default flush mode.
pub const FLUSH_MODE: &str = "persist.flush-mode";
/// Default for binding literals as parameters.
pub const BIND_PARAMETERS: &str = "persist.jdbc.bind-parameters";
/// Default for keeping compiled statements on the connection.
pub const CACHE_STATEMENTS: &str = "persist.jdbc.cache-statements";
/// Instances kept per type in the shared cache, overriding descriptors.
pub const CACHE_SIZE: &str = "persist.cache.size.default";
/// JPQL texts kept in the parse cache.
pub const PARSE_CACHE_SIZE: &str = "persist.parse-cache.size";
/// Lazy loads of one relationship before an N+1 warning.
pub const LAZY_LOAD_THRESHOLD: &str = "persist.lazy-load.warn-threshold";
/// Prefix of properties passed through to every unit of work.
pub const TENANT_PREFIX: &str = "persist.tenant.";

/// Configuration shared by every session of a server.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Last step of the query timeout cascade.
    pub default_timeout: QueryTimeout,
    pub retrieve_mode: CacheRetrieveMode,
    pub store_mode: CacheStoreMode,
    pub flush_mode: FlushMode,
    pub bind_all_parameters: bool,
    pub cache_statements: bool,
    /// Overrides every descriptor's identity-map size when set.
    pub identity_map_size: Option<usize>,
    pub parse_cache_size: usize,
    pub lazy_load_threshold: usize,
    /// Tenant discriminator properties handed to every unit of work.
    pub tenant_properties: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: QueryTimeout::Default,
            retrieve_mode: CacheRetrieveMode::Use,
            store_mode: CacheStoreMode::Use,
            flush_mode: FlushMode::Auto,
            bind_all_parameters: true,
            cache_statements: false,
            identity_map_size: None,
            parse_cache_size: 100,
            lazy_load_threshold: 10,
            tenant_properties: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn default_timeout(mut self, timeout: QueryTimeout) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retrieve_mode(mut self, mode: CacheRetrieveMode) -> Self {
        self.retrieve_mode = mode;
        self
    }

    #[must_use]
    pub fn store_mode(mut self, mode: CacheStoreMode) -> Self {
        self.store_mode = mode;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn bind_all_parameters(mut self, bind: bool) -> Self {
        self.bind_all_parameters = bind;
        self
    }

    #[must_use]
    pub fn cache_statements(mut self, cache: bool) -> Self {
        self.cache_statements = cache;
        self
    }

    #[must_use]
    pub fn identity_map_size(mut self, size: usize) -> Self {
        self.identity_map_size = Some(size);
        self
    }

    #[must_use]
    pub fn parse_cache_size(mut self, size: usize) -> Self {
        self.parse_cache_size = size;
        self
    }

    #[must_use]
    pub fn lazy_load_threshold(mut self, threshold: usize) -> Self {
        self.lazy_load_threshold = threshold;
        self
    }

    #[must_use]
    pub fn tenant_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tenant_properties.insert(key.into(), value.into());
        self
    }

    /// Build a configuration from persistence-unit properties.
    ///
    /// Unrecognized keys are ignored; a recognized key with a malformed value
    /// is a configuration error.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in properties {
            let value = value.trim();
            match key.as_str() {
                hints::QUERY_TIMEOUT | hints::JAKARTA_QUERY_TIMEOUT => {
                    let ms = parse_number(key, value)?;
                    config.default_timeout = if ms == 0 {
                        QueryTimeout::NoTimeout
                    } else {
                        QueryTimeout::millis(ms as u64)
                    };
                }
                hints::CACHE_RETRIEVE_MODE | hints::JAKARTA_CACHE_RETRIEVE_MODE => {
                    config.retrieve_mode =
                        CacheRetrieveMode::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                hints::CACHE_STORE_MODE | hints::JAKARTA_CACHE_STORE_MODE => {
                    config.store_mode =
                        CacheStoreMode::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                FLUSH_MODE => {
                    config.flush_mode =
                        FlushMode::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                BIND_PARAMETERS => config.bind_all_parameters = parse_bool(key, value)?,
                CACHE_STATEMENTS => config.cache_statements = parse_bool(key, value)?,
                CACHE_SIZE => config.identity_map_size = Some(parse_number(key, value)?),
                PARSE_CACHE_SIZE => config.parse_cache_size = parse_number(key, value)?,
                LAZY_LOAD_THRESHOLD => config.lazy_load_threshold = parse_number(key, value)?,
                other if other.starts_with(TENANT_PREFIX) => {
                    config
                        .tenant_properties
                        .insert(other[TENANT_PREFIX.len()..].to_string(), value.to_string());
                }
                other => tracing::trace!(property = other, "Ignoring unrecognized property"),
            }
        }
        tracing::debug!(config = ?config, "Session configuration loaded");
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> Error {
    Error::config(format!("invalid value '{value}' for property '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn properties_override_defaults() {
        let config = SessionConfig::from_properties(&props(&[
            ("javax.persistence.query.timeout", "2500"),
            ("jakarta.persistence.cache.storeMode", "BYPASS"),
            (FLUSH_MODE, "commit"),
            (CACHE_STATEMENTS, "true"),
            (CACHE_SIZE, "5"),
            ("persist.tenant.tenant_id", "acme"),
            ("some.other.vendor", "x"),
        ]))
        .unwrap();
        assert_eq!(
            config.default_timeout.as_duration(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.store_mode, CacheStoreMode::Bypass);
        assert_eq!(config.retrieve_mode, CacheRetrieveMode::Use);
        assert_eq!(config.flush_mode, FlushMode::Commit);
        assert!(config.cache_statements);
        assert_eq!(config.identity_map_size, Some(5));
        assert_eq!(
            config.tenant_properties.get("tenant_id").map(String::as_str),
            Some("acme")
        );
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = SessionConfig::from_properties(&props(&[(BIND_PARAMETERS, "yes")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = SessionConfig::from_properties(&props(&[(
            "javax.persistence.cache.retrieveMode",
            "REFRESH",
        )]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_setters() {
        let config = SessionConfig::new()
            .store_mode(CacheStoreMode::Refresh)
            .identity_map_size(3)
            .tenant_property("tenant", "t1");
        assert_eq!(config.store_mode, CacheStoreMode::Refresh);
        assert_eq!(config.identity_map_size, Some(3));
        assert_eq!(config.tenant_properties.len(), 1);
    }
}
