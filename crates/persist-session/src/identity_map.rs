//! Shared (second-level) cache.
//!
//! One identity map per entity type, keyed by primary key. Each entry is a
//! [`CacheKey`] owning the shared instance plus the foreign keys of protected
//! relationships, which are kept on the side instead of in the instance.
//!
//! # Identity
//!
//! A cached instance is never replaced by a new handle while it is cached.
//! Refreshing an entry overwrites the instance's state in place, so every
//! holder of the `EntityRef` sees the new state.
//!
//! # Eviction
//!
//! Each type's map is bounded by its descriptor's identity-map size. When a
//! map is full the least recently used entry is evicted.

use persist_core::sync;
use persist_core::{
    ClassDescriptor, Entity, EntityRef, Error, PrimaryKey, Result, Value, entity_ref,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// One cached instance.
#[derive(Debug)]
pub struct CacheKey {
    key: PrimaryKey,
    object: EntityRef,
    protected_foreign_keys: BTreeMap<String, Value>,
    read_time: Instant,
    last_used: AtomicU64,
}

impl CacheKey {
    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn object(&self) -> &EntityRef {
        &self.object
    }

    /// Raw foreign keys of relationships not populated in the shared copy.
    pub fn protected_foreign_keys(&self) -> &BTreeMap<String, Value> {
        &self.protected_foreign_keys
    }

    /// When the entry was last read from or written to the database.
    pub fn read_time(&self) -> Instant {
        self.read_time
    }
}

/// A copy of a cache entry taken under the lock.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub object: EntityRef,
    pub protected_foreign_keys: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct TypeMap {
    entries: HashMap<PrimaryKey, CacheKey>,
}

/// The process-wide cache of shared instances.
#[derive(Debug, Default)]
pub struct SharedCache {
    maps: RwLock<HashMap<String, TypeMap>>,
    tick: AtomicU64,
    size_override: Option<usize>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every type's map by `size` instead of its descriptor's size.
    #[must_use]
    pub fn with_size_override(mut self, size: Option<usize>) -> Self {
        self.size_override = size;
        self
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn capacity(&self, desc: &ClassDescriptor) -> usize {
        self.size_override.unwrap_or_else(|| desc.cache_size()).max(1)
    }

    /// The cached instance for `key`.
    pub fn get(&self, entity: &str, key: &PrimaryKey) -> Option<EntityRef> {
        self.lookup(entity, key).map(|e| e.object)
    }

    /// The cached instance for `key` with its protected foreign keys.
    pub fn lookup(&self, entity: &str, key: &PrimaryKey) -> Option<CacheEntry> {
        let maps = sync::read(&self.maps);
        let entry = maps.get(entity)?.entries.get(key)?;
        entry.last_used.store(self.next_tick(), Ordering::Relaxed);
        Some(CacheEntry {
            object: EntityRef::clone(&entry.object),
            protected_foreign_keys: entry.protected_foreign_keys.clone(),
        })
    }

    pub fn contains(&self, entity: &str, key: &PrimaryKey) -> bool {
        sync::read(&self.maps)
            .get(entity)
            .is_some_and(|m| m.entries.contains_key(key))
    }

    /// Cache `object` unless an instance for `key` is already cached.
    ///
    /// Returns the instance that is cached afterwards.
    pub fn insert(
        &self,
        desc: &ClassDescriptor,
        key: PrimaryKey,
        object: EntityRef,
        protected_foreign_keys: BTreeMap<String, Value>,
    ) -> Result<EntityRef> {
        check_cacheable(desc)?;
        let tick = self.next_tick();
        let capacity = self.capacity(desc);
        let mut maps = sync::write(&self.maps);
        let map = maps.entry(desc.entity_name().to_string()).or_default();
        if let Some(existing) = map.entries.get(&key) {
            existing.last_used.store(tick, Ordering::Relaxed);
            return Ok(EntityRef::clone(&existing.object));
        }
        if map.entries.len() >= capacity {
            evict_lru(desc.entity_name(), &mut map.entries);
        }
        tracing::trace!(entity = desc.entity_name(), key = %key, "Caching instance");
        map.entries.insert(
            key.clone(),
            CacheKey {
                key,
                object: EntityRef::clone(&object),
                protected_foreign_keys,
                read_time: Instant::now(),
                last_used: AtomicU64::new(tick),
            },
        );
        Ok(object)
    }

    /// Cache `state` for `key`, overwriting a cached instance in place.
    ///
    /// The cached handle keeps its identity; only its attributes change.
    pub fn put(
        &self,
        desc: &ClassDescriptor,
        key: PrimaryKey,
        state: Entity,
        protected_foreign_keys: BTreeMap<String, Value>,
    ) -> Result<EntityRef> {
        check_cacheable(desc)?;
        let tick = self.next_tick();
        let capacity = self.capacity(desc);
        let mut maps = sync::write(&self.maps);
        let map = maps.entry(desc.entity_name().to_string()).or_default();
        if let Some(existing) = map.entries.get_mut(&key) {
            sync::write(&existing.object).refresh_from(state);
            existing.protected_foreign_keys = protected_foreign_keys;
            existing.read_time = Instant::now();
            existing.last_used.store(tick, Ordering::Relaxed);
            tracing::trace!(entity = desc.entity_name(), key = %key, "Refreshed cached instance");
            return Ok(EntityRef::clone(&existing.object));
        }
        if map.entries.len() >= capacity {
            evict_lru(desc.entity_name(), &mut map.entries);
        }
        let object = entity_ref(state);
        map.entries.insert(
            key.clone(),
            CacheKey {
                key,
                object: EntityRef::clone(&object),
                protected_foreign_keys,
                read_time: Instant::now(),
                last_used: AtomicU64::new(tick),
            },
        );
        Ok(object)
    }

    /// Evict one instance.
    pub fn remove(&self, entity: &str, key: &PrimaryKey) -> Option<EntityRef> {
        let removed = sync::write(&self.maps)
            .get_mut(entity)?
            .entries
            .remove(key)
            .map(|e| e.object);
        if removed.is_some() {
            tracing::debug!(entity = entity, key = %key, "Evicted from shared cache");
        }
        removed
    }

    /// Evict every instance of `entity`. Returns how many were cached.
    pub fn invalidate(&self, entity: &str) -> usize {
        let removed = sync::write(&self.maps)
            .remove(entity)
            .map_or(0, |m| m.entries.len());
        tracing::debug!(entity = entity, removed = removed, "Invalidated shared cache type");
        removed
    }

    /// Every cached instance of `entity`.
    pub fn objects(&self, entity: &str) -> Vec<EntityRef> {
        sync::read(&self.maps)
            .get(entity)
            .map(|m| m.entries.values().map(|e| EntityRef::clone(&e.object)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, entity: &str) -> usize {
        sync::read(&self.maps)
            .get(entity)
            .map_or(0, |m| m.entries.len())
    }

    pub fn total_len(&self) -> usize {
        sync::read(&self.maps).values().map(|m| m.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn clear(&self) {
        sync::write(&self.maps).clear();
    }
}

fn check_cacheable(desc: &ClassDescriptor) -> Result<()> {
    if desc.cache_isolation().is_isolated() {
        return Err(Error::CacheState(format!(
            "'{}' is isolated and cannot be stored in the shared cache",
            desc.entity_name()
        )));
    }
    Ok(())
}

fn evict_lru(entity: &str, entries: &mut HashMap<PrimaryKey, CacheKey>) {
    if let Some(key) = entries
        .iter()
        .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
        .map(|(k, _)| k.clone())
    {
        tracing::trace!(entity = entity, key = %key, "Evicting least recently used instance");
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::{AttributeType, CacheIsolation};
    use std::sync::Arc;

    fn employee() -> ClassDescriptor {
        ClassDescriptor::entity("Employee", "EMPLOYEE")
            .id("id", "EMP_ID", AttributeType::Integer)
            .direct("name", "NAME", AttributeType::Text)
            .identity_map_size(2)
    }

    fn emp(id: i64, name: &str) -> Entity {
        Entity::new("Employee").with("id", id).with("name", name)
    }

    #[test]
    fn insert_keeps_the_first_instance() {
        let cache = SharedCache::new();
        let desc = employee();
        let first = cache
            .insert(&desc, PrimaryKey::single(1i64), entity_ref(emp(1, "a")), BTreeMap::new())
            .unwrap();
        let second = cache
            .insert(&desc, PrimaryKey::single(1i64), entity_ref(emp(1, "b")), BTreeMap::new())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            sync::read(&first).value("name"),
            Some(&Value::Text("a".into()))
        );
    }

    #[test]
    fn put_refreshes_in_place() {
        let cache = SharedCache::new();
        let desc = employee();
        let original = cache
            .put(&desc, PrimaryKey::single(1i64), emp(1, "a"), BTreeMap::new())
            .unwrap();
        let refreshed = cache
            .put(&desc, PrimaryKey::single(1i64), emp(1, "b"), BTreeMap::new())
            .unwrap();
        assert!(Arc::ptr_eq(&original, &refreshed));
        assert_eq!(
            sync::read(&original).value("name"),
            Some(&Value::Text("b".into()))
        );
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = SharedCache::new();
        let desc = employee();
        for id in 1..=2i64 {
            cache
                .insert(&desc, PrimaryKey::single(id), entity_ref(emp(id, "x")), BTreeMap::new())
                .unwrap();
        }
        cache.get("Employee", &PrimaryKey::single(1i64));
        cache
            .insert(&desc, PrimaryKey::single(3i64), entity_ref(emp(3, "x")), BTreeMap::new())
            .unwrap();
        assert_eq!(cache.len("Employee"), 2);
        assert!(cache.contains("Employee", &PrimaryKey::single(1i64)));
        assert!(!cache.contains("Employee", &PrimaryKey::single(2i64)));
    }

    #[test]
    fn isolated_types_are_refused() {
        let cache = SharedCache::new();
        let desc = employee().isolation(CacheIsolation::Isolated);
        let err = cache
            .put(&desc, PrimaryKey::single(1i64), emp(1, "a"), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::CacheState(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_returns_protected_keys() {
        let cache = SharedCache::new();
        let desc = employee();
        let fks = BTreeMap::from([("badge".to_string(), Value::BigInt(9))]);
        cache
            .put(&desc, PrimaryKey::single(1i64), emp(1, "a"), fks)
            .unwrap();
        let entry = cache.lookup("Employee", &PrimaryKey::single(1i64)).unwrap();
        assert_eq!(entry.protected_foreign_keys.get("badge"), Some(&Value::BigInt(9)));
        assert_eq!(cache.invalidate("Employee"), 1);
        assert!(cache.get("Employee", &PrimaryKey::single(1i64)).is_none());
    }
}
