//! Read-through cache with single-flight recomputation across processes.
//!
//! On a miss, only the process holding the recomputation lock for a key
//! runs the expensive computation. Everyone else polls the cache until the
//! value appears or their wait budget runs out, then computes it themselves
//! rather than block forever behind a stuck leader.
//!
//! Values are stored as JSON under `cache:{namespace}:{key}`; the lock for
//! that key is the mutex key `lock:cache:{namespace}:{key}`. When the shared
//! store fails before the computation starts, the same algorithm runs
//! against a process-local store and mutex, so stampede protection still
//! holds among this process's tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use corral_store::InMemoryStore;
use corral_store::SharedStore;
use corral_store::SharedStoreRef;
use corral_store::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

use crate::constants::DEFAULT_CACHE_LOCK_TTL_MS;
use crate::constants::DEFAULT_CACHE_POLL_INTERVAL_MS;
use crate::constants::DEFAULT_CACHE_TTL_MS;
use crate::constants::DEFAULT_CACHE_WAIT_TIMEOUT_MS;
use crate::constants::MAX_POLL_INTERVAL_MS;
use crate::constants::MAX_TTL_MS;
use crate::constants::MAX_WAIT_TIMEOUT_MS;
use crate::constants::MIN_POLL_INTERVAL_MS;
use crate::error::CoordinationError;
use crate::error::at_most;
use crate::error::invalid;
use crate::metrics::FallbackMetrics;
use crate::metrics::FallbackSnapshot;
use crate::mutex::DistributedMutex;
use crate::verified;

/// Configuration for [`StampedeCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry lifetime for namespaces not listed in `dataset_ttls`.
    pub default_ttl: Duration,
    /// Entry lifetime per namespace.
    pub dataset_ttls: HashMap<String, Duration>,
    /// Lifetime of the recomputation lock; bounds how long a crashed
    /// leader blocks others.
    pub lock_ttl: Duration,
    /// How long a follower waits for the leader's value.
    pub wait_timeout: Duration,
    /// Sleep between follower polls.
    pub poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            dataset_ttls: HashMap::new(),
            lock_ttl: Duration::from_millis(DEFAULT_CACHE_LOCK_TTL_MS),
            wait_timeout: Duration::from_millis(DEFAULT_CACHE_WAIT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_CACHE_POLL_INTERVAL_MS),
        }
    }
}

impl CacheConfig {
    /// Entry lifetime for `dataset`.
    pub fn ttl_for(&self, dataset: &str) -> Duration {
        self.dataset_ttls.get(dataset).copied().unwrap_or(self.default_ttl)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.default_ttl.is_zero() || self.dataset_ttls.values().any(Duration::is_zero) {
            return Err(invalid("cache", "entry TTLs must be non-zero"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("cache", "lock_ttl must be non-zero"));
        }
        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(invalid("cache", "poll_interval must be at least 1ms"));
        }
        at_most("cache", "default_ttl", self.default_ttl, MAX_TTL_MS)?;
        for ttl in self.dataset_ttls.values() {
            at_most("cache", "dataset TTL", *ttl, MAX_TTL_MS)?;
        }
        at_most("cache", "lock_ttl", self.lock_ttl, MAX_TTL_MS)?;
        at_most("cache", "wait_timeout", self.wait_timeout, MAX_WAIT_TIMEOUT_MS)?;
        at_most("cache", "poll_interval", self.poll_interval, MAX_POLL_INTERVAL_MS)?;
        Ok(())
    }
}

/// A store plus the mutex that guards recomputation in it.
struct Tier {
    store: SharedStoreRef,
    mutex: Arc<DistributedMutex>,
}

impl Tier {
    fn over(store: SharedStoreRef) -> Self {
        let mutex = Arc::new(DistributedMutex::new(Arc::clone(&store)));
        Self { store, mutex }
    }
}

/// What happened when the algorithm ran against one tier.
enum TierOutcome<R, F> {
    /// A value was read or computed.
    Done(R),
    /// The store failed before `compute` was called; it is handed back.
    Unavailable(F),
}

/// A read-through cache for one namespace.
pub struct StampedeCache {
    namespace: String,
    config: CacheConfig,
    shared: Option<Tier>,
    local: Tier,
    metrics: FallbackMetrics,
}

impl StampedeCache {
    /// Create a cache for `namespace`. With `store` set to `None` values are
    /// cached and recomputation is deduplicated within this process only.
    pub fn new(
        namespace: impl Into<String>,
        store: Option<SharedStoreRef>,
        config: CacheConfig,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        let local: SharedStoreRef = Arc::new(InMemoryStore::new());
        Ok(Self {
            namespace: namespace.into(),
            config,
            shared: store.map(Tier::over),
            local: Tier::over(local),
            metrics: FallbackMetrics::default(),
        })
    }

    /// The cache namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Entry lifetime used by [`StampedeCache::fetch`].
    pub fn ttl(&self) -> Duration {
        self.config.ttl_for(&self.namespace)
    }

    /// Operation counters.
    pub fn metrics(&self) -> FallbackSnapshot {
        self.metrics.snapshot()
    }

    /// [`StampedeCache::get_or_fetch`] with the namespace's configured TTL.
    pub async fn fetch<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_fetch(key, self.ttl(), compute).await
    }

    /// Return the cached value for `key`, computing and caching it on a miss.
    ///
    /// Errors from `compute` are returned unchanged and nothing is cached.
    /// Store failures never surface: at worst `compute` runs without
    /// cross-process deduplication.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cache_key = verified::cache_key(&self.namespace, key);
        let compute = match &self.shared {
            Some(tier) => {
                self.metrics.record_shared();
                match self.fetch_through(tier, &cache_key, ttl, compute).await {
                    TierOutcome::Done(result) => return result,
                    TierOutcome::Unavailable(compute) => {
                        self.metrics.record_store_error();
                        warn!(key = %cache_key, "cache store unavailable, using local cache");
                        compute
                    }
                }
            }
            None => compute,
        };

        self.metrics.record_local();
        match self.fetch_through(&self.local, &cache_key, ttl, compute).await {
            TierOutcome::Done(result) => result,
            TierOutcome::Unavailable(compute) => compute().await,
        }
    }

    async fn fetch_through<T, E, F, Fut>(
        &self,
        tier: &Tier,
        cache_key: &str,
        ttl: Duration,
        compute: F,
    ) -> TierOutcome<Result<T, E>, F>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match read(tier.store.as_ref(), cache_key).await {
            Ok(Some(value)) => {
                debug!(key = cache_key, "cache hit");
                return TierOutcome::Done(Ok(value));
            }
            Ok(None) => {}
            Err(_) => return TierOutcome::Unavailable(compute),
        }

        if let Some(guard) = tier.mutex.lock(cache_key, self.config.lock_ttl).await {
            // Another process may have filled the key between our miss and our lock.
            if let Ok(Some(value)) = read(tier.store.as_ref(), cache_key).await {
                guard.release().await;
                return TierOutcome::Done(Ok(value));
            }
            debug!(key = cache_key, "cache miss, computing");
            let result = compute().await;
            if let Ok(value) = &result {
                write(tier.store.as_ref(), cache_key, value, ttl).await;
            }
            guard.release().await;
            return TierOutcome::Done(result);
        }

        debug!(key = cache_key, "cache miss, waiting for another computation");
        let deadline = verified::deadline_after(Instant::now(), self.config.wait_timeout);
        while let Some(delay) = verified::next_poll_delay(Instant::now(), deadline, self.config.poll_interval) {
            tokio::time::sleep(delay).await;
            match read(tier.store.as_ref(), cache_key).await {
                Ok(Some(value)) => return TierOutcome::Done(Ok(value)),
                Ok(None) => {}
                Err(_) => return TierOutcome::Unavailable(compute),
            }
        }

        self.metrics.record_timeout();
        warn!(
            key = cache_key,
            wait_ms = self.config.wait_timeout.as_millis() as u64,
            "cache wait expired, computing without lock"
        );
        let result = compute().await;
        if let Ok(value) = &result {
            write(tier.store.as_ref(), cache_key, value, ttl).await;
        }
        TierOutcome::Done(result)
    }
}

async fn read<T: DeserializeOwned>(store: &dyn SharedStore, key: &str) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable cache entry");
            Ok(None)
        }
    }
}

async fn write<T: Serialize>(store: &dyn SharedStore, key: &str, value: &T, ttl: Duration) {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key, error = %e, "cache value could not be encoded, not caching");
            return;
        }
    };
    if let Err(e) = store.set_with_ttl(key, &bytes, ttl).await {
        warn!(key, error = %e, "cache write failed");
    }
}
