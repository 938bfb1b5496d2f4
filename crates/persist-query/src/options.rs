//! Per-query policy enums.
//!
//! Each enum parses from the textual values used in query hints and
//! persistence-unit properties. Parsing is case-insensitive.

use std::fmt;

/// How far an operation on an object cascades to its related objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CascadePolicy {
    NoCascading,
    /// Cascade to privately owned parts (collections).
    #[default]
    CascadePrivateParts,
    CascadeAllParts,
    CascadeDependentParts,
    CascadeAggregateDelete,
    /// Follow each mapping's own cascade setting.
    CascadeByMapping,
}

impl CascadePolicy {
    /// Whether a refresh of an object also refreshes its resolved references.
    pub const fn cascades_to_references(self) -> bool {
        matches!(
            self,
            CascadePolicy::CascadeAllParts | CascadePolicy::CascadeByMapping
        )
    }

    /// Whether a refresh also refreshes fetched collections.
    pub const fn cascades_to_collections(self) -> bool {
        !matches!(self, CascadePolicy::NoCascading)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let policy = match text.to_ascii_lowercase().as_str() {
            "none" | "nocascading" => CascadePolicy::NoCascading,
            "private" | "cascadeprivateparts" => CascadePolicy::CascadePrivateParts,
            "all" | "cascadeallparts" => CascadePolicy::CascadeAllParts,
            "dependent" | "cascadedependentparts" => CascadePolicy::CascadeDependentParts,
            "aggregate" | "cascadeaggregatedelete" => CascadePolicy::CascadeAggregateDelete,
            "mapping" | "cascadebymapping" => CascadePolicy::CascadeByMapping,
            _ => return None,
        };
        Some(policy)
    }
}

/// Whether and how an object read consults the shared cache first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CacheUsage {
    /// By primary key for single-object reads, never for the rest.
    #[default]
    UseDescriptorSetting,
    DoNotCheckCache,
    CheckCacheByPrimaryKey,
    /// Answer from the cache when a cached instance matches, else the database.
    CheckCacheThenDatabase,
    /// Answer from the cache only; a miss is an empty result.
    CheckCacheOnly,
}

impl CacheUsage {
    pub fn parse(text: &str) -> Option<Self> {
        let usage = match text.to_ascii_lowercase().as_str() {
            "usedescriptorsetting" => CacheUsage::UseDescriptorSetting,
            "donotcheckcache" => CacheUsage::DoNotCheckCache,
            "checkcachebyprimarykey" => CacheUsage::CheckCacheByPrimaryKey,
            "checkcachethendatabase" => CacheUsage::CheckCacheThenDatabase,
            "checkcacheonly" => CacheUsage::CheckCacheOnly,
            _ => return None,
        };
        Some(usage)
    }
}

/// Whether a read may be answered from the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CacheRetrieveMode {
    #[default]
    Use,
    Bypass,
}

impl CacheRetrieveMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "USE" => Some(CacheRetrieveMode::Use),
            "BYPASS" => Some(CacheRetrieveMode::Bypass),
            _ => None,
        }
    }
}

impl fmt::Display for CacheRetrieveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheRetrieveMode::Use => f.write_str("USE"),
            CacheRetrieveMode::Bypass => f.write_str("BYPASS"),
        }
    }
}

/// Whether the results of a read are written to the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CacheStoreMode {
    /// Store instances that are not cached yet; cached ones are left alone.
    #[default]
    Use,
    /// Never write the shared cache.
    Bypass,
    /// Always read the database and overwrite cached instances in place.
    Refresh,
}

impl CacheStoreMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "USE" => Some(CacheStoreMode::Use),
            "BYPASS" => Some(CacheStoreMode::Bypass),
            "REFRESH" => Some(CacheStoreMode::Refresh),
            _ => None,
        }
    }
}

impl fmt::Display for CacheStoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStoreMode::Use => f.write_str("USE"),
            CacheStoreMode::Bypass => f.write_str("BYPASS"),
            CacheStoreMode::Refresh => f.write_str("REFRESH"),
        }
    }
}

/// When pending changes are written before a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum FlushMode {
    /// Flush before every query executed in an active transaction.
    #[default]
    Auto,
    /// Flush only at commit.
    Commit,
}

impl FlushMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "AUTO" => Some(FlushMode::Auto),
            "COMMIT" => Some(FlushMode::Commit),
            _ => None,
        }
    }
}
