//! Distributed resource locks
//!
//! TTL-based mutual exclusion over hierarchical [`ResourcePath`]s, shared by
//! every worker process through a [`LockStore`]:
//!
//! - a lock is a `(namespace, path)` key holding an opaque token and an
//!   expiry; only the token holder may refresh or release it
//! - holding a path excludes its ancestors and descendants; strict-siblings
//!   mode also excludes siblings of the held path
//! - multi-path requests are collapsed and sorted (see
//!   [`bulkport_common::paths::collapse`]) so all callers acquire in the same
//!   order and circular waits cannot form
//! - a held [`LockSet`] renews itself from a heartbeat task; a holder that
//!   dies simply stops renewing and its locks expire

use bulkport_common::ResourcePath;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod manager;
mod memory;
mod postgres;
mod store;

pub use manager::{AcquireOptions, LockManager, LockSet};
pub use memory::{EvictionPolicy, MemoryLockStore};
pub use postgres::{PgLockStore, MAX_LOCK_TTL};
pub use store::{ConflictProbe, LockStore};

/// Result type alias for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Resource busy: {namespace}:{path} could not be locked within {waited:?}")]
    Busy {
        namespace: String,
        path: String,
        waited: Duration,
    },

    #[error("Invalid lock path: {0}")]
    InvalidPath(#[from] bulkport_common::CommonError),

    #[error("Lock registry full ({capacity} entries)")]
    Capacity { capacity: usize },

    #[error("Lock store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LockError {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. })
    }
}

/// Identity of a single lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub namespace: String,
    pub path: ResourcePath,
}

impl LockKey {
    pub fn new(namespace: impl Into<String>, path: ResourcePath) -> Self {
        Self {
            namespace: namespace.into(),
            path,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}
