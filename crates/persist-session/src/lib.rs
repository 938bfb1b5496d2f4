//! Sessions for the persist object-relational layer.
//!
//! `persist-session` is where queries meet objects. It owns the shared
//! (second-level) cache and the two kinds of session that execute queries
//! against it.
//!
//! # Role In The Architecture
//!
//! - **Shared cache**: one identity map per type, bounded, isolation-aware.
//! - **Server session**: process-wide, thread-safe, reads through the cache.
//! - **Unit of work**: one client's transactional working set of clones,
//!   conformed into query results and merged into the cache at commit.
//!
//! # Example
//!
//! ```ignore
//! let server = ServerSession::new(project, connection, SessionConfig::default())?;
//!
//! let mut uow = server.acquire_unit_of_work(HashMap::new());
//! let emp = uow.find("Employee", &[Value::BigInt(1)])?;
//! if let Some(emp) = emp {
//!     sync::write(&emp).set("salary", 5000i64);
//! }
//! uow.commit()?;
//! ```

pub mod change_tracker;
pub mod config;
mod execution;
pub mod flush;
pub mod identity_map;
pub mod merge;
pub mod object_builder;
pub mod server;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use config::SessionConfig;
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingOp};
pub use identity_map::{CacheEntry, CacheKey, SharedCache};
pub use merge::{CommitSet, MergeStats, merge_commit, restore_protected, shared_state};
pub use object_builder::{Built, ObjectBuilder};
pub use server::ServerSession;
pub use unit_of_work::{ObjectState, PendingCounts, UnitOfWork};

use persist_core::PrimaryKey;

/// Identity of one object: its entity type and primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    entity: String,
    key: PrimaryKey,
}

impl ObjectKey {
    pub fn new(entity: impl Into<String>, key: PrimaryKey) -> Self {
        Self {
            entity: entity.into(),
            key,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.entity, self.key)
    }
}
