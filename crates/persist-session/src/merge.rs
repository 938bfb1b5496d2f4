//! Moving object state between working copies and the shared cache.
//!
//! A protected type may be cached, but its relationships to non-shared types
//! must not be visible through the shared copy. Those relationships are
//! removed from the shared state and their foreign keys kept in the cache
//! key, to be restored into each unit of work's working copy.

use crate::ObjectKey;
use crate::identity_map::SharedCache;
use persist_core::{
    AttributeValue, CollectionHolder, ClassDescriptor, Entity, Mapping, Project, Result, Value,
};
use persist_query::CacheStoreMode;
use std::collections::{BTreeMap, BTreeSet};

/// Split `entity` into the state stored in the shared cache and the foreign
/// keys of relationships the shared copy may not expose.
pub fn shared_state(
    project: &Project,
    desc: &ClassDescriptor,
    entity: &Entity,
) -> (Entity, BTreeMap<String, Value>) {
    let mut state = entity.detached_copy();
    let mut protected = BTreeMap::new();
    if !desc.cache_isolation().is_shared() {
        strip_protected(project, desc, &mut state, "", &mut protected);
    }
    (state, protected)
}

fn strip_protected(
    project: &Project,
    desc: &ClassDescriptor,
    state: &mut Entity,
    prefix: &str,
    out: &mut BTreeMap<String, Value>,
) {
    for mapping in desc.mappings() {
        let attribute = mapping.attribute();
        match mapping {
            Mapping::Direct { .. } => {}
            Mapping::Reference { target, .. } | Mapping::Collection { target, .. } => {
                if project.is_shared_isolation(target) {
                    continue;
                }
                if let Some(AttributeValue::Reference(holder)) = state.remove(attribute) {
                    if let Some(key) = holder.key() {
                        out.insert(format!("{prefix}{attribute}"), key.clone());
                    }
                }
            }
            Mapping::Embedded { embeddable, .. } => {
                if project.is_shared_isolation(embeddable) {
                    continue;
                }
                let Some(inner_desc) = project.descriptor(embeddable) else {
                    continue;
                };
                if let Some(AttributeValue::Embedded(Some(inner))) = state.get_mut(attribute) {
                    let nested = format!("{prefix}{attribute}.");
                    strip_protected(project, inner_desc, inner, &nested, out);
                }
            }
        }
    }
}

/// Rebuild the relationships [`shared_state`] removed, unresolved.
pub fn restore_protected(
    project: &Project,
    desc: &ClassDescriptor,
    entity: &mut Entity,
    protected: &BTreeMap<String, Value>,
) {
    restore_level(project, desc, entity, "", protected);
}

fn restore_level(
    project: &Project,
    desc: &ClassDescriptor,
    entity: &mut Entity,
    prefix: &str,
    protected: &BTreeMap<String, Value>,
) {
    for mapping in desc.mappings() {
        let attribute = mapping.attribute();
        match mapping {
            Mapping::Direct { .. } => {}
            Mapping::Reference { .. } => {
                if entity.get(attribute).is_none() {
                    let key = protected
                        .get(&format!("{prefix}{attribute}"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    entity.set_reference_key(attribute, key);
                }
            }
            Mapping::Collection { .. } => {
                if entity.get(attribute).is_none() {
                    entity.set_attribute(
                        attribute,
                        AttributeValue::Collection(CollectionHolder::unfetched()),
                    );
                }
            }
            Mapping::Embedded { embeddable, .. } => {
                let Some(inner_desc) = project.descriptor(embeddable) else {
                    continue;
                };
                if let Some(AttributeValue::Embedded(Some(inner))) = entity.get_mut(attribute) {
                    let nested = format!("{prefix}{attribute}.");
                    restore_level(project, inner_desc, inner, &nested, protected);
                }
            }
        }
    }
}

// ============================================================================
// Commit merge
// ============================================================================

/// What a committed unit of work hands to the shared cache.
#[derive(Debug, Default)]
pub struct CommitSet {
    /// New and changed objects with their committed state.
    pub changed: Vec<(ObjectKey, Entity)>,
    pub deleted: Vec<ObjectKey>,
    /// Types touched by bulk updates or deletes.
    pub invalidated: BTreeSet<String>,
}

impl CommitSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty() && self.invalidated.is_empty()
    }
}

/// Counts from one commit merge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub merged: usize,
    pub evicted: usize,
    /// Changed objects left out of the shared cache: isolated types, and
    /// everything under store mode `Bypass`.
    pub skipped: usize,
}

/// Merge a committed change set into the shared cache.
///
/// Deleted objects are always evicted. Changed objects are written in place
/// under `Use` and `Refresh`; under `Bypass` the cached entries are left as
/// they were.
#[tracing::instrument(level = "debug", skip(project, cache, set))]
pub fn merge_commit(
    project: &Project,
    cache: &SharedCache,
    set: CommitSet,
    store_mode: CacheStoreMode,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    for entity in &set.invalidated {
        cache.invalidate(entity);
    }
    for key in &set.deleted {
        if cache.remove(key.entity(), key.key()).is_some() {
            stats.evicted += 1;
        }
    }
    for (key, state) in set.changed {
        let desc = project.require(key.entity())?;
        if desc.cache_isolation().is_isolated() {
            stats.skipped += 1;
            continue;
        }
        if store_mode == CacheStoreMode::Bypass {
            stats.skipped += 1;
            continue;
        }
        let (shared, protected) = shared_state(project, desc, &state);
        cache.put(desc, key.key().clone(), shared, protected)?;
        stats.merged += 1;
    }
    tracing::debug!(
        merged = stats.merged,
        evicted = stats.evicted,
        skipped = stats.skipped,
        "Merged commit into shared cache"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::{AttributeType, CacheIsolation, PrimaryKey, sync};

    fn project() -> Project {
        let mut project = Project::new()
            .with(
                ClassDescriptor::entity("Badge", "BADGE")
                    .id("id", "ID", AttributeType::Integer)
                    .isolation(CacheIsolation::Isolated),
            )
            .with(
                ClassDescriptor::entity("Department", "DEPT")
                    .id("id", "ID", AttributeType::Integer),
            )
            .with(
                ClassDescriptor::entity("Employee", "EMPLOYEE")
                    .id("id", "ID", AttributeType::Integer)
                    .direct("name", "NAME", AttributeType::Text)
                    .one_to_one("badge", "Badge", "BADGE_ID")
                    .many_to_one("department", "Department", "DEPT_ID"),
            );
        project.initialize().unwrap();
        project
    }

    fn employee() -> Entity {
        let mut e = Entity::new("Employee").with("id", 1i64).with("name", "Ann");
        e.set_reference_key("badge", Value::BigInt(7));
        e.set_reference_key("department", Value::BigInt(3));
        e
    }

    #[test]
    fn protected_relationship_moves_to_side_table() {
        let project = project();
        let desc = project.descriptor("Employee").unwrap();
        assert!(!desc.cache_isolation().is_shared());

        let (shared, protected) = shared_state(&project, desc, &employee());
        assert!(shared.get("badge").is_none());
        assert_eq!(protected.get("badge"), Some(&Value::BigInt(7)));
        assert_eq!(
            shared.reference("department").and_then(|h| h.key()),
            Some(&Value::BigInt(3))
        );

        let mut working = shared.clone();
        restore_protected(&project, desc, &mut working, &protected);
        assert_eq!(
            working.reference("badge").and_then(|h| h.key()),
            Some(&Value::BigInt(7))
        );
    }

    #[test]
    fn commit_merge_respects_isolation_and_store_mode() {
        let project = project();
        let cache = SharedCache::new();
        let emp_key = ObjectKey::new("Employee", PrimaryKey::single(1i64));
        let badge_key = ObjectKey::new("Badge", PrimaryKey::single(7i64));

        let set = CommitSet {
            changed: vec![
                (emp_key.clone(), employee()),
                (badge_key.clone(), Entity::new("Badge").with("id", 7i64)),
            ],
            ..CommitSet::default()
        };
        let stats = merge_commit(&project, &cache, set, CacheStoreMode::Use).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.skipped, 1);
        let cached = cache.get("Employee", emp_key.key()).unwrap();
        assert!(sync::read(&cached).get("badge").is_none());

        let set = CommitSet {
            changed: vec![(emp_key.clone(), employee().with("name", "Bo"))],
            ..CommitSet::default()
        };
        let stats = merge_commit(&project, &cache, set, CacheStoreMode::Bypass).unwrap();
        assert_eq!(stats, MergeStats { merged: 0, evicted: 0, skipped: 1 });
        let still = cache.get("Employee", emp_key.key()).unwrap();
        assert!(std::sync::Arc::ptr_eq(&still, &cached));
        assert_eq!(
            sync::read(&still).value("name"),
            Some(&Value::Text("Ann".into()))
        );
    }

    #[test]
    fn deletes_always_evict() {
        let project = project();
        let cache = SharedCache::new();
        let desc = project.descriptor("Department").unwrap();
        cache
            .put(
                desc,
                PrimaryKey::single(3i64),
                Entity::new("Department").with("id", 3i64),
                BTreeMap::new(),
            )
            .unwrap();
        let set = CommitSet {
            deleted: vec![ObjectKey::new("Department", PrimaryKey::single(3i64))],
            ..CommitSet::default()
        };
        let stats = merge_commit(&project, &cache, set, CacheStoreMode::Bypass).unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(cache.is_empty());
    }
}
