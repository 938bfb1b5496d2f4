//! Flush operation ordering for units of work.
//!
//! Pending changes are written in an order that respects foreign keys:
//! - DELETE child-first
//! - INSERT parent-first
//! - UPDATE last, in the order given
//!
//! Versioned updates and deletes carry the version read into the working
//! copy; a statement that matches no row is an optimistic lock failure.

use crate::ObjectKey;
use persist_core::sync;
use persist_core::{
    AttributeValue, ClassDescriptor, Connection, Entity, EntityRef, Error, Mapping,
    OptimisticLockError, Project, Result, Value, ValueHolder,
};
use std::collections::HashMap;

/// A pending database operation.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new object. Columns are read when the insert runs, so keys
    /// generated for parents earlier in the flush are picked up.
    Insert {
        entity: String,
        table: String,
        object: EntityRef,
    },
    /// Update the changed columns of an existing row.
    Update {
        key: ObjectKey,
        table: String,
        pk_columns: Vec<String>,
        pk_values: Vec<Value>,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        /// Version column and the version the working copy was read at.
        version: Option<(String, i64)>,
    },
    /// Delete an existing row.
    Delete {
        key: ObjectKey,
        table: String,
        pk_columns: Vec<String>,
        pk_values: Vec<Value>,
        version: Option<(String, i64)>,
    },
}

impl PendingOp {
    pub fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    /// The object key; unknown for inserts until their key is assigned.
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            PendingOp::Insert { .. } => None,
            PendingOp::Update { key, .. } | PendingOp::Delete { key, .. } => Some(key),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Orders operations by table foreign-key dependencies.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> tables it has foreign keys to.
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every mapped table of `project`.
    pub fn for_project(project: &Project) -> Self {
        let mut orderer = Self::new();
        for desc in project.descriptors().filter(|d| !d.is_embeddable()) {
            orderer.register_table(desc.table(), project.table_dependencies(desc));
        }
        orderer
    }

    pub fn register_table(&mut self, table: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(table.into(), depends_on);
    }

    fn dependency_count(&self, table: &str) -> usize {
        self.dependencies.get(table).map_or(0, Vec::len)
    }

    /// Group and sort operations into a plan.
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut plan = FlushPlan::new();
        for op in ops {
            match op {
                PendingOp::Delete { .. } => plan.deletes.push(op),
                PendingOp::Insert { .. } => plan.inserts.push(op),
                PendingOp::Update { .. } => plan.updates.push(op),
            }
        }
        // Stable sorts keep the given order within a table.
        plan.deletes
            .sort_by_key(|op| std::cmp::Reverse(self.dependency_count(op.table())));
        plan.inserts
            .sort_by_key(|op| self.dependency_count(op.table()));
        plan
    }
}

/// Operations grouped for execution.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Ordered child-first.
    pub deletes: Vec<PendingOp>,
    /// Ordered parent-first.
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
}

/// What a flush wrote.
#[derive(Debug, Default)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Inserted objects with the keys they were written under.
    pub new_keys: Vec<(ObjectKey, EntityRef)>,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    /// Add the counts and keys of another flush step.
    pub fn absorb(&mut self, other: FlushResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.new_keys.extend(other.new_keys);
    }
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Execute the plan: deletes, then inserts, then updates.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn execute(&self, conn: &dyn Connection, project: &Project) -> Result<FlushResult> {
        if self.is_empty() {
            return Ok(FlushResult::default());
        }
        tracing::debug!(
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in &self.deletes {
            execute_delete(conn, op)?;
            result.deleted += 1;
        }
        for op in &self.inserts {
            if let PendingOp::Insert { entity, object, .. } = op {
                let key = execute_insert(conn, project, entity, object)?;
                result.new_keys.push((key, EntityRef::clone(object)));
                result.inserted += 1;
            }
        }
        for op in &self.updates {
            if execute_update(conn, op)? {
                result.updated += 1;
            }
        }

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }
}

// ============================================================================
// Statements
// ============================================================================

/// Copy the primary key of each resolved reference target into the holder.
pub fn sync_reference_keys(project: &Project, desc: &ClassDescriptor, entity: &mut Entity) {
    for mapping in desc.mappings() {
        let Mapping::Reference { attribute, target, .. } = mapping else {
            continue;
        };
        let Some(target_desc) = project.descriptor(target) else {
            continue;
        };
        let Some(holder) = entity.reference(attribute) else {
            continue;
        };
        let Some(target_ref) = holder.value().cloned() else {
            continue;
        };
        // A self reference is already write-locked by the caller.
        let key = match target_ref.try_read() {
            Ok(target) => target
                .primary_key(target_desc)
                .and_then(|k| k.values().first().cloned())
                .unwrap_or(Value::Null),
            Err(_) => continue,
        };
        entity.set_attribute(
            attribute.clone(),
            AttributeValue::Reference(ValueHolder::resolved(key, target_ref)),
        );
    }
}

fn execute_insert(
    conn: &dyn Connection,
    project: &Project,
    entity: &str,
    object: &EntityRef,
) -> Result<ObjectKey> {
    let desc = project.require(entity)?;
    let dialect = conn.dialect();
    let mut state = sync::write(object);
    sync_reference_keys(project, desc, &mut state);

    let generate = desc.has_generated_id() && state.primary_key(desc).is_none();
    let pk_columns = desc.primary_key_columns();
    let columns: Vec<(String, Value)> = state
        .column_values(project, desc)
        .into_iter()
        .filter(|(c, _)| !(generate && pk_columns.contains(&c.as_str())))
        .collect();

    let names: Vec<String> = columns.iter().map(|(c, _)| dialect.quote_identifier(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_identifier(desc.table()),
        names.join(", "),
        placeholders.join(", ")
    );
    let params: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
    tracing::trace!(sql = %sql, "Executing INSERT");

    if generate {
        let id = conn.insert(&sql, &params)?;
        if let Some(attr) = desc.primary_key().first() {
            state.set(attr.clone(), id);
        }
    } else {
        conn.execute(&sql, &params, None)?;
    }

    let key = state.primary_key(desc).ok_or_else(|| {
        Error::illegal_state(format!(
            "inserted '{}' has no primary key",
            desc.entity_name()
        ))
    })?;
    Ok(ObjectKey::new(desc.entity_name(), key))
}

/// Returns false when there was nothing to set.
fn execute_update(conn: &dyn Connection, op: &PendingOp) -> Result<bool> {
    let PendingOp::Update {
        key,
        table,
        pk_columns,
        pk_values,
        set_columns,
        set_values,
        version,
    } = op
    else {
        return Ok(false);
    };
    if set_columns.is_empty() {
        return Ok(false);
    }
    let dialect = conn.dialect();
    let mut params: Vec<Value> = set_values.clone();
    let mut assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", dialect.quote_identifier(c), dialect.placeholder(i + 1)))
        .collect();
    if let Some((column, current)) = version {
        params.push(Value::BigInt(current + 1));
        assignments.push(format!(
            "{} = {}",
            dialect.quote_identifier(column),
            dialect.placeholder(params.len())
        ));
    }
    let mut sql = format!(
        "UPDATE {} SET {}",
        dialect.quote_identifier(table),
        assignments.join(", ")
    );
    sql.push_str(&where_clause(conn, pk_columns, pk_values, version.as_ref(), &mut params));
    tracing::trace!(sql = %sql, "Executing UPDATE");

    let affected = conn.execute(&sql, &params, None)?;
    check_affected(affected, key, version.as_ref(), "updated")?;
    Ok(true)
}

fn execute_delete(conn: &dyn Connection, op: &PendingOp) -> Result<()> {
    let PendingOp::Delete {
        key,
        table,
        pk_columns,
        pk_values,
        version,
    } = op
    else {
        return Ok(());
    };
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", conn.dialect().quote_identifier(table));
    sql.push_str(&where_clause(conn, pk_columns, pk_values, version.as_ref(), &mut params));
    tracing::trace!(sql = %sql, "Executing DELETE");

    let affected = conn.execute(&sql, &params, None)?;
    check_affected(affected, key, version.as_ref(), "deleted")
}

fn where_clause(
    conn: &dyn Connection,
    pk_columns: &[String],
    pk_values: &[Value],
    version: Option<&(String, i64)>,
    params: &mut Vec<Value>,
) -> String {
    let dialect = conn.dialect();
    let mut conditions = Vec::new();
    for (column, value) in pk_columns.iter().zip(pk_values) {
        params.push(value.clone());
        conditions.push(format!(
            "{} = {}",
            dialect.quote_identifier(column),
            dialect.placeholder(params.len())
        ));
    }
    if let Some((column, current)) = version {
        params.push(Value::BigInt(*current));
        conditions.push(format!(
            "{} = {}",
            dialect.quote_identifier(column),
            dialect.placeholder(params.len())
        ));
    }
    format!(" WHERE {}", conditions.join(" AND "))
}

fn check_affected(
    affected: u64,
    key: &ObjectKey,
    version: Option<&(String, i64)>,
    action: &str,
) -> Result<()> {
    if affected > 0 {
        return Ok(());
    }
    let Some((_, expected)) = version else {
        tracing::warn!(entity = key.entity(), key = %key.key(), "No row {action}");
        return Ok(());
    };
    tracing::warn!(
        entity = key.entity(),
        key = %key.key(),
        expected_version = expected,
        "Optimistic lock failure"
    );
    Err(Error::OptimisticLock(OptimisticLockError {
        entity: key.entity().to_string(),
        primary_key: key.key().to_string(),
        expected_version: Some(*expected),
        message: format!(
            "'{}' with key {} could not be {action}: it was changed or removed concurrently",
            key.entity(),
            key.key()
        ),
    }))
}
