use async_trait::async_trait;
use bulkport_common::ResourcePath;
use std::time::Duration;

use super::{LockKey, LockResult};

/// Which held paths would overlap a freshly acquired one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictProbe {
    /// Strict ancestors of the acquired path
    pub ancestors: Vec<ResourcePath>,
    /// Any held path strictly below this root conflicts
    pub subtree_root: ResourcePath,
}

impl ConflictProbe {
    /// Probe for `path`; with `strict_siblings` the subtree widens to the parent
    pub fn for_path(path: &ResourcePath, strict_siblings: bool) -> Self {
        let subtree_root = if strict_siblings {
            path.parent().unwrap_or_else(|| path.clone())
        } else {
            path.clone()
        };
        Self {
            ancestors: path.ancestors(),
            subtree_root,
        }
    }

    pub fn conflicts_with(&self, held: &ResourcePath) -> bool {
        self.ancestors.contains(held) || self.subtree_root.is_ancestor_of(held)
    }
}

/// Key/TTL store backing the lock manager
///
/// Every call is a single atomic operation against the backing store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` unless another unexpired token holds it
    async fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool>;

    /// Push the expiry of a lock still held by `token`
    async fn refresh(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool>;

    /// Delete the lock if `token` still holds it
    async fn release(&self, key: &LockKey, token: &str) -> LockResult<bool>;

    /// Unexpired paths held by other tokens in `namespace` that match `probe`
    async fn find_conflicts(
        &self,
        namespace: &str,
        probe: &ConflictProbe,
        token: &str,
    ) -> LockResult<Vec<ResourcePath>>;
}
