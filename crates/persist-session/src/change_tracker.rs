//! Change tracking and dirty detection for units of work.
//!
//! Each registered working copy gets a backup clone taken at registration.
//! At flush the working copy's column values are compared with the backup's;
//! only columns that differ are written.

use crate::ObjectKey;
use persist_core::{ClassDescriptor, Entity, Project, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Backup of one working copy.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    state: Entity,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(state: Entity) -> Self {
        Self {
            state,
            taken_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &Entity {
        &self.state
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Backups of every registered working copy.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (or retake) the backup of `entity`.
    #[tracing::instrument(level = "trace", skip(self, entity))]
    pub fn snapshot(&mut self, key: ObjectKey, entity: &Entity) {
        self.snapshots
            .insert(key, ObjectSnapshot::new(entity.detached_copy()));
    }

    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn get_snapshot(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    /// Columns whose value differs from the backup, with the current value.
    ///
    /// Without a backup every column counts as changed.
    pub fn changed_columns(
        &self,
        key: &ObjectKey,
        entity: &Entity,
        project: &Project,
        desc: &ClassDescriptor,
    ) -> Vec<(String, Value)> {
        let current = entity.column_values(project, desc);
        let Some(snapshot) = self.snapshots.get(key) else {
            return current;
        };
        let original = snapshot.state.column_values(project, desc);
        let changed: Vec<(String, Value)> = current
            .into_iter()
            .zip(original)
            .filter(|((_, now), (_, before))| now.normalized() != before.normalized())
            .map(|(now, _)| now)
            .collect();
        tracing::trace!(
            entity = key.entity(),
            key = %key.key(),
            changed = changed.len(),
            "Compared working copy with backup"
        );
        changed
    }

    pub fn is_dirty(
        &self,
        key: &ObjectKey,
        entity: &Entity,
        project: &Project,
        desc: &ClassDescriptor,
    ) -> bool {
        !self.changed_columns(key, entity, project, desc).is_empty()
    }

    pub fn clear(&mut self, key: &ObjectKey) {
        self.snapshots.remove(key);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
