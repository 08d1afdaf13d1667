use bulkport_common::paths::collapse;
use bulkport_common::ResourcePath;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::store::{ConflictProbe, LockStore};
use super::{LockError, LockKey, LockResult};
use crate::config::LockConfig;
use crate::retry::Backoff;

/// Per-call acquisition settings
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub ttl: Duration,
    /// Budget shared by every path of one acquisition
    pub timeout: Duration,
    pub backoff: Backoff,
    pub strict_siblings: bool,
    /// Heartbeat period as a fraction of `ttl`
    pub heartbeat_ratio: f64,
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn heartbeat_every(&self) -> Duration {
        self.ttl
            .mul_f64(self.heartbeat_ratio)
            .max(Duration::from_millis(1))
    }
}

/// Acquires and releases lock sets against a [`LockStore`]
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn default_options(&self) -> AcquireOptions {
        AcquireOptions {
            ttl: self.config.ttl(),
            timeout: self.config.acquire_timeout(),
            backoff: self.config.backoff(),
            strict_siblings: self.config.strict_siblings,
            heartbeat_ratio: self.config.heartbeat_ratio,
        }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Lock a single path
    pub async fn acquire(
        &self,
        namespace: &str,
        path: &ResourcePath,
        options: &AcquireOptions,
    ) -> LockResult<LockSet> {
        self.acquire_many(namespace, [path.clone()], options).await
    }

    /// Lock every path in `paths` or none of them
    ///
    /// Paths are collapsed to their covering ancestors and taken in depth
    /// then lexicographic order against one shared deadline. On failure the
    /// locks already taken are released before the error is returned.
    #[instrument(skip(self, paths, options), fields(namespace))]
    pub async fn acquire_many<I>(
        &self,
        namespace: &str,
        paths: I,
        options: &AcquireOptions,
    ) -> LockResult<LockSet>
    where
        I: IntoIterator<Item = ResourcePath>,
    {
        let ordered = collapse(paths);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + options.timeout;
        let mut held: Vec<LockKey> = Vec::with_capacity(ordered.len());

        for path in ordered {
            let key = LockKey::new(namespace, path);
            match self.acquire_one(&key, &token, options, started, deadline).await {
                Ok(()) => held.push(key),
                Err(e) => {
                    release_all(self.store.as_ref(), &held, &token).await;
                    return Err(e);
                },
            }
        }

        debug!(
            locks = held.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Lock set acquired"
        );

        let heartbeat = if held.is_empty() {
            None
        } else {
            Some(Heartbeat::start(
                self.store.clone(),
                held.clone(),
                token.clone(),
                options.ttl,
                options.heartbeat_every(),
            ))
        };

        Ok(LockSet {
            store: self.store.clone(),
            keys: held,
            token,
            heartbeat,
        })
    }

    async fn acquire_one(
        &self,
        key: &LockKey,
        token: &str,
        options: &AcquireOptions,
        started: Instant,
        deadline: Instant,
    ) -> LockResult<()> {
        let probe = ConflictProbe::for_path(&key.path, options.strict_siblings);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if self.store.try_acquire(key, token, options.ttl).await? {
                let conflicts = self
                    .store
                    .find_conflicts(&key.namespace, &probe, token)
                    .await?;
                if conflicts.is_empty() {
                    return Ok(());
                }

                debug!(lock = %key, ?conflicts, "Overlapping lock held elsewhere, backing off");
                if let Err(e) = self.store.release(key, token).await {
                    warn!(lock = %key, error = %e, "Failed to drop contended lock");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                info!(lock = %key, attempts = attempt, "Lock acquisition timed out");
                return Err(LockError::Busy {
                    namespace: key.namespace.clone(),
                    path: key.path.to_string(),
                    waited: now.duration_since(started),
                });
            }

            sleep(options.backoff.delay(attempt).min(deadline - now)).await;
        }
    }

    /// Run `f` while holding the lock set; the set is released on every exit
    pub async fn with_locks<T, E, F, Fut>(
        &self,
        namespace: &str,
        paths: Vec<ResourcePath>,
        options: &AcquireOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let locks = self.acquire_many(namespace, paths, options).await?;
        let result = f().await;
        locks.release().await;
        result
    }
}

async fn release_all(store: &dyn LockStore, keys: &[LockKey], token: &str) {
    for key in keys {
        match store.release(key, token).await {
            Ok(true) => debug!(lock = %key, "Lock released"),
            Ok(false) => warn!(lock = %key, "Lock was no longer held at release"),
            Err(e) => warn!(lock = %key, error = %e, "Lock release failed, leaving it to expire"),
        }
    }
}

/// Background renewal of a held lock set
struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(
        store: Arc<dyn LockStore>,
        keys: Vec<LockKey>,
        token: String,
        ttl: Duration,
        every: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        for key in &keys {
                            match store.refresh(key, &token, ttl).await {
                                Ok(true) => {},
                                Ok(false) => warn!(lock = %key, "Heartbeat found lock no longer held"),
                                Err(e) => warn!(lock = %key, error = %e, "Heartbeat refresh failed"),
                            }
                        }
                    }
                }
            }
        });

        Self { stop, handle }
    }

    /// Stop renewing and wait until no refresh is in flight
    async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Lock heartbeat task panicked");
            }
        }
    }

    fn abort(self) {
        self.stop.cancel();
        self.handle.abort();
    }
}

/// Locks held by one acquisition, renewed until released
#[must_use = "dropping a LockSet releases it in the background"]
pub struct LockSet {
    store: Arc<dyn LockStore>,
    keys: Vec<LockKey>,
    token: String,
    heartbeat: Option<Heartbeat>,
}

impl LockSet {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stop the heartbeat, then release every lock (best-effort)
    pub async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        let keys = std::mem::take(&mut self.keys);
        release_all(self.store.as_ref(), &keys, &self.token).await;
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.keys.is_empty() {
            return;
        }

        let keys = std::mem::take(&mut self.keys);
        let token = std::mem::take(&mut self.token);
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    release_all(store.as_ref(), &keys, &token).await;
                });
            },
            Err(_) => warn!(
                locks = keys.len(),
                "Lock set dropped outside a runtime, locks will expire after their TTL"
            ),
        }
    }
}

impl std::fmt::Debug for LockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet")
            .field("keys", &self.keys)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;

    fn manager() -> (Arc<MemoryLockStore>, LockManager) {
        let store = Arc::new(MemoryLockStore::new(64));
        let config = LockConfig {
            ttl_ms: 1_000,
            acquire_timeout_ms: 200,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            ..LockConfig::default()
        };
        (store.clone(), LockManager::new(store, config))
    }

    fn p(raw: &str) -> ResourcePath {
        ResourcePath::parse(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ancestor_lock_blocks_descendant() {
        let (_, locks) = manager();
        let opts = locks.default_options();
        let parent = locks.acquire("media", &p("/companies/acme"), &opts).await.unwrap();

        let err = locks
            .acquire("media", &p("/companies/acme/catalog"), &opts)
            .await
            .unwrap_err();
        match err {
            LockError::Busy { namespace, path, .. } => {
                assert_eq!(namespace, "media");
                assert_eq!(path, "/companies/acme/catalog");
            },
            other => panic!("unexpected error: {other}"),
        }

        parent.release().await;
        assert!(locks.acquire("media", &p("/companies/acme/catalog"), &opts).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_set_releases_partial_acquisitions() {
        let (store, locks) = manager();
        let opts = locks.default_options();
        let blocker = locks.acquire("media", &p("/z"), &opts).await.unwrap();

        let err = locks
            .acquire_many("media", vec![p("/a"), p("/z")], &opts)
            .await
            .unwrap_err();
        assert!(err.is_busy());
        assert!(store.holder(&LockKey::new("media", p("/a"))).is_none());

        blocker.release().await;
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_lock_past_ttl() {
        let (store, locks) = manager();
        let opts = locks.default_options();
        let held = locks.acquire("media", &p("/a"), &opts).await.unwrap();
        let key = LockKey::new("media", p("/a"));
        let token = held.token().to_string();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(store.holder(&key), Some(token));

        held.release().await;
        assert!(store.holder(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_locks_releases_on_error() {
        let (store, locks) = manager();
        let opts = locks.default_options();

        let result: Result<(), LockError> = locks
            .with_locks("media", vec![p("/a/b")], &opts, || async {
                Err(LockError::Store("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_in_background() {
        let (store, locks) = manager();
        let opts = locks.default_options();
        {
            let _held = locks.acquire("media", &p("/a"), &opts).await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.live_count(), 0);
    }
}
