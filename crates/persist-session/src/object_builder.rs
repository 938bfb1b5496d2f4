//! Turning result rows into objects under a cache retrieve/store mode.

use crate::identity_map::SharedCache;
use crate::merge::shared_state;
use persist_core::{ClassDescriptor, Entity, EntityRef, Project, Result, Row, entity_ref};
use persist_query::{CacheRetrieveMode, CacheStoreMode};

/// An object built from a row.
#[derive(Debug, Clone)]
pub enum Built {
    /// The instance held by the shared cache.
    Shared(EntityRef),
    /// An instance no cache knows about.
    Detached(EntityRef),
}

impl Built {
    pub fn object(&self) -> &EntityRef {
        match self {
            Built::Shared(o) | Built::Detached(o) => o,
        }
    }

    pub fn into_object(self) -> EntityRef {
        match self {
            Built::Shared(o) | Built::Detached(o) => o,
        }
    }
}

/// Builds objects of one type from rows.
///
/// | retrieve | store   | row for a cached key        | row for an uncached key |
/// |----------|---------|-----------------------------|-------------------------|
/// | USE      | USE     | cached instance, untouched  | cached                  |
/// | BYPASS   | USE     | cached instance overwritten | cached                  |
/// | any      | REFRESH | cached instance overwritten | cached                  |
/// | USE      | BYPASS  | cached instance, untouched  | detached                |
/// | BYPASS   | BYPASS  | detached                    | detached                |
pub struct ObjectBuilder<'a> {
    project: &'a Project,
    desc: &'a ClassDescriptor,
    cache: &'a SharedCache,
    retrieve: CacheRetrieveMode,
    store: CacheStoreMode,
}

impl<'a> ObjectBuilder<'a> {
    pub fn new(
        project: &'a Project,
        desc: &'a ClassDescriptor,
        cache: &'a SharedCache,
        retrieve: CacheRetrieveMode,
        store: CacheStoreMode,
    ) -> Self {
        Self {
            project,
            desc,
            cache,
            retrieve,
            store,
        }
    }

    pub fn build(&self, row: &Row) -> Result<Built> {
        let entity = Entity::from_row(self.project, self.desc, row)?;
        if self.desc.cache_isolation().is_isolated() {
            return Ok(Built::Detached(entity_ref(entity)));
        }
        let Some(key) = entity.primary_key(self.desc) else {
            return Ok(Built::Detached(entity_ref(entity)));
        };
        let name = self.desc.entity_name();

        let overwrite = self.store == CacheStoreMode::Refresh
            || (self.store == CacheStoreMode::Use && self.retrieve == CacheRetrieveMode::Bypass);
        if overwrite {
            let (state, protected) = shared_state(self.project, self.desc, &entity);
            return Ok(Built::Shared(self.cache.put(self.desc, key, state, protected)?));
        }

        if self.retrieve == CacheRetrieveMode::Use {
            if let Some(cached) = self.cache.get(name, &key) {
                return Ok(Built::Shared(cached));
            }
        }
        if self.store == CacheStoreMode::Bypass {
            return Ok(Built::Detached(entity_ref(entity)));
        }
        let (state, protected) = shared_state(self.project, self.desc, &entity);
        Ok(Built::Shared(self.cache.insert(
            self.desc,
            key,
            entity_ref(state),
            protected,
        )?))
    }

    pub fn build_all(&self, rows: &[Row]) -> Result<Vec<Built>> {
        rows.iter().map(|row| self.build(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::{AttributeType, PrimaryKey, Value, sync};
    use std::sync::Arc;

    fn project() -> Project {
        let mut p = Project::new().with(
            ClassDescriptor::entity("Employee", "EMPLOYEE")
                .id("id", "ID", AttributeType::Integer)
                .direct("name", "NAME", AttributeType::Text),
        );
        p.initialize().unwrap();
        p
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["ID".into(), "NAME".into()],
            vec![Value::BigInt(id), Value::Text(name.into())],
        )
    }

    fn name_of(o: &EntityRef) -> Value {
        sync::read(o).value("name").cloned().unwrap_or(Value::Null)
    }

    #[test]
    fn use_use_keeps_cached_state() {
        let project = project();
        let desc = project.descriptor("Employee").unwrap();
        let cache = SharedCache::new();
        let b = ObjectBuilder::new(&project, desc, &cache, CacheRetrieveMode::Use, CacheStoreMode::Use);
        let first = b.build(&row(1, "a")).unwrap().into_object();
        let second = b.build(&row(1, "b")).unwrap().into_object();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(name_of(&second), Value::Text("a".into()));
    }

    #[test]
    fn refresh_overwrites_in_place() {
        let project = project();
        let desc = project.descriptor("Employee").unwrap();
        let cache = SharedCache::new();
        let use_use =
            ObjectBuilder::new(&project, desc, &cache, CacheRetrieveMode::Use, CacheStoreMode::Use);
        let cached = use_use.build(&row(1, "a")).unwrap().into_object();

        let refresh = ObjectBuilder::new(
            &project,
            desc,
            &cache,
            CacheRetrieveMode::Use,
            CacheStoreMode::Refresh,
        );
        let refreshed = refresh.build(&row(1, "b")).unwrap().into_object();
        assert!(Arc::ptr_eq(&cached, &refreshed));
        assert_eq!(name_of(&cached), Value::Text("b".into()));
    }

    #[test]
    fn bypass_bypass_never_touches_the_cache() {
        let project = project();
        let desc = project.descriptor("Employee").unwrap();
        let cache = SharedCache::new();
        let b = ObjectBuilder::new(
            &project,
            desc,
            &cache,
            CacheRetrieveMode::Bypass,
            CacheStoreMode::Bypass,
        );
        assert!(matches!(b.build(&row(1, "a")).unwrap(), Built::Detached(_)));
        assert!(cache.get("Employee", &PrimaryKey::single(1i64)).is_none());
    }
}
