use async_trait::async_trait;
use bulkport_common::ResourcePath;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::store::{ConflictProbe, LockStore};
use super::{LockError, LockKey, LockResult};

/// What a full registry does with a new key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Refuse the acquisition with [`LockError::Capacity`]
    #[default]
    RejectNew,
    /// Drop the live entry that was acquired first
    EvictOldest,
}

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
    sequence: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<LockKey, Entry>,
    next_sequence: u64,
}

/// Capacity-bounded, in-process lock registry
///
/// Suitable for a single worker process and for tests; expiry follows
/// `tokio::time`, so paused-clock tests control it exactly.
#[derive(Debug)]
pub struct MemoryLockStore {
    registry: Mutex<Registry>,
    capacity: usize,
    policy: EvictionPolicy,
}

impl MemoryLockStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, EvictionPolicy::default())
    }

    pub fn with_policy(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of unexpired locks
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.registry()
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn holder(&self, key: &LockKey) -> Option<String> {
        let now = Instant::now();
        self.registry()
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.token.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool> {
        let now = Instant::now();
        let mut registry = self.registry();

        if let Some(entry) = registry.entries.get(key) {
            if entry.is_live(now) && entry.token != token {
                return Ok(false);
            }
        }

        if !registry.entries.contains_key(key) && registry.entries.len() >= self.capacity {
            registry.entries.retain(|_, e| e.is_live(now));

            if registry.entries.len() >= self.capacity {
                match self.policy {
                    EvictionPolicy::RejectNew => {
                        return Err(LockError::Capacity {
                            capacity: self.capacity,
                        })
                    },
                    EvictionPolicy::EvictOldest => {
                        let oldest = registry
                            .entries
                            .iter()
                            .min_by_key(|(_, e)| e.sequence)
                            .map(|(k, _)| k.clone());
                        if let Some(evicted) = oldest {
                            tracing::warn!(lock = %evicted, "Lock registry full, evicting oldest entry");
                            registry.entries.remove(&evicted);
                        }
                    },
                }
            }
        }

        let sequence = registry.next_sequence;
        registry.next_sequence += 1;
        registry.entries.insert(
            key.clone(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
                sequence,
            },
        );
        Ok(true)
    }

    async fn refresh(&self, key: &LockKey, token: &str, ttl: Duration) -> LockResult<bool> {
        let now = Instant::now();
        let mut registry = self.registry();
        match registry.entries.get_mut(key) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &LockKey, token: &str) -> LockResult<bool> {
        let mut registry = self.registry();
        let owned = registry
            .entries
            .get(key)
            .is_some_and(|entry| entry.token == token);
        if owned {
            registry.entries.remove(key);
        }
        Ok(owned)
    }

    async fn find_conflicts(
        &self,
        namespace: &str,
        probe: &ConflictProbe,
        token: &str,
    ) -> LockResult<Vec<ResourcePath>> {
        let now = Instant::now();
        let registry = self.registry();
        let mut conflicts: Vec<ResourcePath> = registry
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.namespace == namespace
                    && entry.token != token
                    && entry.is_live(now)
                    && probe.conflicts_with(&key.path)
            })
            .map(|(key, _)| key.path.clone())
            .collect();
        conflicts.sort();
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> LockKey {
        LockKey::new("media", ResourcePath::parse(path).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_frees_exactly_at_ttl() {
        let store = MemoryLockStore::new(16);
        let ttl = Duration::from_millis(1_000);
        assert!(store.try_acquire(&key("/a"), "holder", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!store.try_acquire(&key("/a"), "other", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.try_acquire(&key("/a"), "other", ttl).await.unwrap());
        assert_eq!(store.holder(&key("/a")).as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_refresh_and_release_require_token() {
        let store = MemoryLockStore::new(16);
        let ttl = Duration::from_secs(5);
        store.try_acquire(&key("/a"), "t1", ttl).await.unwrap();

        assert!(!store.refresh(&key("/a"), "t2", ttl).await.unwrap());
        assert!(!store.release(&key("/a"), "t2").await.unwrap());
        assert!(store.refresh(&key("/a"), "t1", ttl).await.unwrap());
        assert!(store.release(&key("/a"), "t1").await.unwrap());
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_new_when_full() {
        let store = MemoryLockStore::new(2);
        let ttl = Duration::from_secs(5);
        store.try_acquire(&key("/a"), "t", ttl).await.unwrap();
        store.try_acquire(&key("/b"), "t", ttl).await.unwrap();

        let err = store.try_acquire(&key("/c"), "t", ttl).await.unwrap_err();
        assert!(matches!(err, LockError::Capacity { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_evict_oldest_when_full() {
        let store = MemoryLockStore::with_policy(2, EvictionPolicy::EvictOldest);
        let ttl = Duration::from_secs(5);
        store.try_acquire(&key("/a"), "t", ttl).await.unwrap();
        store.try_acquire(&key("/b"), "t", ttl).await.unwrap();
        store.try_acquire(&key("/c"), "t", ttl).await.unwrap();

        assert!(store.holder(&key("/a")).is_none());
        assert!(store.holder(&key("/c")).is_some());
        assert_eq!(store.live_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_free_capacity() {
        let store = MemoryLockStore::new(1);
        store
            .try_acquire(&key("/a"), "t", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(store
            .try_acquire(&key("/b"), "t", Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_find_conflicts_ignores_own_token_and_other_namespaces() {
        let store = MemoryLockStore::new(16);
        let ttl = Duration::from_secs(5);
        store.try_acquire(&key("/a"), "mine", ttl).await.unwrap();
        store.try_acquire(&key("/a/b/c"), "theirs", ttl).await.unwrap();
        store
            .try_acquire(&LockKey::new("files", ResourcePath::parse("/a/b/d").unwrap()), "theirs", ttl)
            .await
            .unwrap();

        let probe = ConflictProbe::for_path(&ResourcePath::parse("/a/b").unwrap(), false);
        let conflicts = store.find_conflicts("media", &probe, "mine").await.unwrap();
        assert_eq!(conflicts, vec![ResourcePath::parse("/a/b/c").unwrap()]);
    }
}
