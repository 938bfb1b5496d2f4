//! Parse cache for JPQL text.
//!
//! Queries created from JPQL text with every property at its default are
//! shared across call sites: the first caller parses, later callers get the
//! same `Arc<DatabaseQuery>` and therefore the same prepared call. Named or
//! hinted queries are never looked up here.

use crate::query::DatabaseQuery;
use persist_core::Result;
use persist_core::sync;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

/// A cached parsed query.
#[derive(Debug, Clone)]
struct CachedQuery {
    query: Arc<DatabaseQuery>,
    /// Access tick; the smallest tick is evicted first.
    last_used: u64,
    hit_count: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CachedQuery>,
    tick: u64,
}

/// LRU cache of parsed queries keyed by JPQL text.
#[derive(Debug)]
pub struct ParseCache {
    entries: Mutex<Entries>,
    max_size: usize,
}

impl ParseCache {
    /// Create a cache holding at most `max_size` queries. Zero disables it.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_size,
        }
    }

    /// Return the cached query for `text`, parsing it with `parse` on a miss.
    ///
    /// Parsing runs outside the lock. When two threads miss at once the first
    /// insert wins and both callers receive that instance.
    pub fn get_or_parse(
        &self,
        text: &str,
        parse: impl FnOnce() -> Result<DatabaseQuery>,
    ) -> Result<Arc<DatabaseQuery>> {
        if self.max_size == 0 {
            return parse().map(Arc::new);
        }
        {
            let mut entries = sync::lock(&self.entries);
            entries.tick += 1;
            let tick = entries.tick;
            if let Some(entry) = entries.map.get_mut(text) {
                entry.last_used = tick;
                entry.hit_count += 1;
                tracing::trace!(hits = entry.hit_count, "Parse cache hit");
                return Ok(Arc::clone(&entry.query));
            }
        }

        let parsed = Arc::new(parse()?);

        let mut entries = sync::lock(&self.entries);
        if !entries.map.contains_key(text) && entries.map.len() >= self.max_size {
            evict_lru(&mut entries.map);
        }
        entries.tick += 1;
        let tick = entries.tick;
        let entry = entries
            .map
            .entry(text.to_string())
            .or_insert_with(|| CachedQuery {
                query: parsed,
                last_used: tick,
                hit_count: 0,
            });
        Ok(Arc::clone(&entry.query))
    }

    pub fn contains(&self, text: &str) -> bool {
        sync::lock(&self.entries).map.contains_key(text)
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.entries).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        sync::lock(&self.entries).map.clear();
    }
}

impl Default for ParseCache {
    fn default() -> Self {
        Self::new(100)
    }
}

fn evict_lru(map: &mut HashMap<String, CachedQuery>) {
    if let Some(key) = map
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(k, _)| k.clone())
    {
        tracing::trace!(query = %key, "Evicting parsed query");
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn parse(text: &str) -> Result<DatabaseQuery> {
        DatabaseQuery::jpql(text)
    }

    #[test]
    fn second_lookup_shares_the_instance() {
        let cache = ParseCache::new(10);
        let text = "SELECT e FROM Employee e";
        let first = cache.get_or_parse(text, || parse(text)).unwrap();

        let called = Cell::new(false);
        let second = cache
            .get_or_parse(text, || {
                called.set(true);
                parse(text)
            })
            .unwrap();
        assert!(!called.get());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn parse_errors_are_not_cached() {
        let cache = ParseCache::new(10);
        assert!(cache.get_or_parse("SELECT", || parse("SELECT")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ParseCache::new(2);
        let a = "SELECT e FROM Employee e";
        let b = "SELECT d FROM Department d";
        let c = "SELECT p FROM Project p";
        cache.get_or_parse(a, || parse(a)).unwrap();
        cache.get_or_parse(b, || parse(b)).unwrap();
        cache.get_or_parse(a, || parse(a)).unwrap();
        cache.get_or_parse(c, || parse(c)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
    }

    #[test]
    fn zero_size_disables_sharing() {
        let cache = ParseCache::new(0);
        let text = "SELECT e FROM Employee e";
        let first = cache.get_or_parse(text, || parse(text)).unwrap();
        let second = cache.get_or_parse(text, || parse(text)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
