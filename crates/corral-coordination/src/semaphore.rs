//! Named counting semaphores across processes.
//!
//! Each named guard is a sorted set `guard:{name}:slots` whose members are
//! random slot ids scored by their expiry time. Acquiring prunes expired
//! slots, checks the count against the guard's capacity and adds the new
//! slot in one atomic script, so concurrent acquirers can never push the set
//! past capacity. A crashed holder's slot stops counting once its expiry
//! passes.
//!
//! If the store fails, acquisition falls back to a per-name
//! [`tokio::sync::Semaphore`] of the same capacity for the rest of the wait
//! budget. Local permits bound this process only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use corral_store::Script;
use corral_store::SharedStore;
use corral_store::SharedStoreRef;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::warn;

use crate::constants::DEFAULT_ACQUIRE_WAIT_TIMEOUT_MS;
use crate::constants::DEFAULT_SEMAPHORE_CAPACITY;
use crate::constants::DEFAULT_SEMAPHORE_POLL_INTERVAL_MS;
use crate::constants::DEFAULT_SLOT_TTL_MS;
use crate::constants::MAX_POLL_INTERVAL_MS;
use crate::constants::MAX_SEMAPHORE_CAPACITY;
use crate::constants::MAX_TTL_MS;
use crate::constants::MAX_WAIT_TIMEOUT_MS;
use crate::constants::MIN_POLL_INTERVAL_MS;
use crate::error::CoordinationError;
use crate::error::at_most;
use crate::error::invalid;
use crate::metrics::FallbackMetrics;
use crate::metrics::FallbackSnapshot;
use crate::types::Backing;
use crate::types::new_token;
use crate::types::now_unix_ms;
use crate::verified;

/// Configuration for [`DistributedSemaphore`].
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Capacity of any guard not listed in `capacities`.
    pub default_capacity: u32,
    /// Per-name capacities.
    pub capacities: HashMap<String, u32>,
    /// Lifetime of a slot.
    pub slot_ttl: Duration,
    /// How long [`DistributedSemaphore::acquire`] waits.
    pub wait_timeout: Duration,
    /// Sleep between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_SEMAPHORE_CAPACITY,
            capacities: HashMap::new(),
            slot_ttl: Duration::from_millis(DEFAULT_SLOT_TTL_MS),
            wait_timeout: Duration::from_millis(DEFAULT_ACQUIRE_WAIT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_SEMAPHORE_POLL_INTERVAL_MS),
        }
    }
}

impl SemaphoreConfig {
    /// Set the capacity of one named guard.
    pub fn with_capacity(mut self, name: impl Into<String>, capacity: u32) -> Self {
        self.capacities.insert(name.into(), capacity);
        self
    }

    /// Capacity of the guard called `name`.
    pub fn capacity_for(&self, name: &str) -> u32 {
        self.capacities.get(name).copied().unwrap_or(self.default_capacity)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        let check = |name: &str, capacity: u32| {
            if capacity == 0 || capacity > MAX_SEMAPHORE_CAPACITY {
                return Err(invalid(
                    "semaphore",
                    format!("capacity of '{name}' must be in 1..={MAX_SEMAPHORE_CAPACITY}, got {capacity}"),
                ));
            }
            Ok(())
        };
        check("<default>", self.default_capacity)?;
        for (name, capacity) in &self.capacities {
            check(name, *capacity)?;
        }
        if self.slot_ttl.is_zero() {
            return Err(invalid("semaphore", "slot_ttl must be non-zero"));
        }
        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(invalid("semaphore", "poll_interval must be at least 1ms"));
        }
        at_most("semaphore", "slot_ttl", self.slot_ttl, MAX_TTL_MS)?;
        at_most("semaphore", "wait_timeout", self.wait_timeout, MAX_WAIT_TIMEOUT_MS)?;
        at_most("semaphore", "poll_interval", self.poll_interval, MAX_POLL_INTERVAL_MS)?;
        Ok(())
    }
}

/// Proof of holding a semaphore slot.
#[derive(Debug)]
pub struct SlotToken {
    name: String,
    id: String,
    backing: Backing,
    acquired_at_ms: u64,
    permit: parking_lot::Mutex<Option<OwnedSemaphorePermit>>,
}

impl SlotToken {
    /// Name of the guard this slot belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot id. For shared slots this is the sorted-set member.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the slot lives in the shared store or in a local permit.
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// When the slot was acquired (Unix milliseconds).
    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }
}

/// A counting semaphore per name, shared across processes.
pub struct DistributedSemaphore {
    shared: Option<SharedStoreRef>,
    config: SemaphoreConfig,
    local: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
    metrics: FallbackMetrics,
}

impl DistributedSemaphore {
    /// Create a semaphore set. With `store` set to `None` every guard uses
    /// process-local permits.
    pub fn new(store: Option<SharedStoreRef>, config: SemaphoreConfig) -> Result<Self, CoordinationError> {
        config.validate()?;
        Ok(Self {
            shared: store,
            config,
            local: parking_lot::Mutex::new(HashMap::new()),
            metrics: FallbackMetrics::default(),
        })
    }

    /// Capacity of the guard called `name`.
    pub fn capacity(&self, name: &str) -> u32 {
        self.config.capacity_for(name)
    }

    /// Operation counters.
    pub fn metrics(&self) -> FallbackSnapshot {
        self.metrics.snapshot()
    }

    fn local_semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut local = self.local.lock();
        let capacity = self.capacity(name) as usize;
        Arc::clone(local.entry(name.to_string()).or_insert_with(|| Arc::new(Semaphore::new(capacity))))
    }

    /// Acquire a slot using the configured slot TTL and wait timeout.
    pub async fn acquire(&self, name: &str) -> Option<SlotToken> {
        self.try_acquire(name, self.config.slot_ttl, self.config.wait_timeout).await
    }

    /// Acquire a slot on `name` that lives for `ttl`, waiting up to
    /// `wait_timeout`.
    ///
    /// At least one attempt is made even with a zero wait. Returns `None` if
    /// no slot freed up in time.
    pub async fn try_acquire(&self, name: &str, ttl: Duration, wait_timeout: Duration) -> Option<SlotToken> {
        let deadline = verified::deadline_after(Instant::now(), wait_timeout);
        let Some(store) = &self.shared else {
            return self.acquire_local(name, deadline).await;
        };
        let key = verified::slots_key(name);
        let capacity = self.capacity(name);

        loop {
            let now_ms = now_unix_ms();
            let id = new_token();
            let script = Script::AcquireSlot {
                key: key.clone(),
                member: id.clone(),
                capacity,
                now_ms,
                expires_at_ms: verified::compute_expiry_ms(now_ms, ttl),
            };
            let script_name = script.name();
            match store.eval(script).await.and_then(|o| o.into_applied(script_name)) {
                Ok(true) => {
                    self.metrics.record_shared();
                    debug!(name, slot = %id, capacity, "semaphore slot acquired");
                    return Some(SlotToken {
                        name: name.to_string(),
                        id,
                        backing: Backing::Shared,
                        acquired_at_ms: now_ms,
                        permit: parking_lot::Mutex::new(None),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.record_store_error();
                    warn!(name, error = %e, "semaphore store unavailable, falling back to local permits");
                    return self.acquire_local(name, deadline).await;
                }
            }

            match verified::next_poll_delay(Instant::now(), deadline, self.config.poll_interval) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    self.metrics.record_timeout();
                    debug!(name, capacity, wait_ms = wait_timeout.as_millis() as u64, "semaphore acquire timed out");
                    return None;
                }
            }
        }
    }

    async fn acquire_local(&self, name: &str, deadline: Instant) -> Option<SlotToken> {
        self.metrics.record_local();
        let semaphore = self.local_semaphore(name);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => {
                let id = new_token();
                debug!(name, slot = %id, "local semaphore permit acquired");
                Some(SlotToken {
                    name: name.to_string(),
                    id,
                    backing: Backing::Local,
                    acquired_at_ms: now_unix_ms(),
                    permit: parking_lot::Mutex::new(Some(permit)),
                })
            }
            Ok(Err(_closed)) => None,
            Err(_elapsed) => {
                self.metrics.record_timeout();
                debug!(name, "local semaphore acquire timed out");
                None
            }
        }
    }

    /// Release a slot. Releasing twice, or after the slot expired, is a no-op.
    pub async fn release(&self, token: &SlotToken) {
        match token.backing {
            Backing::Local => {
                if token.permit.lock().take().is_some() {
                    debug!(name = %token.name, slot = %token.id, "local semaphore permit released");
                }
            }
            Backing::Shared => self.release_shared(&token.name, &token.id).await,
        }
    }

    async fn release_shared(&self, name: &str, id: &str) {
        let Some(store) = &self.shared else {
            return;
        };
        let script = Script::ReleaseSlot {
            key: verified::slots_key(name),
            member: id.to_string(),
        };
        let script_name = script.name();
        match store.eval(script).await.and_then(|o| o.into_applied(script_name)) {
            Ok(true) => debug!(name, slot = id, "semaphore slot released"),
            Ok(false) => debug!(name, slot = id, "semaphore slot already expired or released"),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(name, slot = id, error = %e, "semaphore release failed, slot will expire by TTL");
            }
        }
    }

    /// Number of slots currently held on `name`.
    ///
    /// Counts live shared slots, or local permits in use when there is no
    /// store or it cannot be reached.
    pub async fn held(&self, name: &str) -> u64 {
        if let Some(store) = &self.shared {
            let script = Script::CountSlots {
                key: verified::slots_key(name),
                now_ms: now_unix_ms(),
            };
            let script_name = script.name();
            match store.eval(script).await.and_then(|o| o.into_count(script_name)) {
                Ok(count) => return count,
                Err(e) => {
                    self.metrics.record_store_error();
                    warn!(name, error = %e, "semaphore count failed, reporting local permits");
                }
            }
        }
        let semaphore = self.local_semaphore(name);
        (self.capacity(name) as usize).saturating_sub(semaphore.available_permits()) as u64
    }

    /// Acquire a slot wrapped in a guard that releases on drop.
    pub async fn acquire_guard(self: &Arc<Self>, name: &str) -> Option<SlotGuard> {
        let token = self.acquire(name).await?;
        Some(SlotGuard {
            semaphore: Arc::clone(self),
            token,
            released: false,
        })
    }

    /// Run `f` while holding a slot on `name`.
    ///
    /// Returns `None` without running `f` if no slot was acquired in time.
    pub async fn run<F, Fut, T>(self: &Arc<Self>, name: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_guard(name).await?;
        let output = f().await;
        guard.release().await;
        Some(output)
    }
}

/// A held slot that is released when dropped.
///
/// Local permits are returned synchronously on drop. Shared slots are
/// released by a task spawned onto the current Tokio runtime, or left to
/// expire by TTL outside a runtime.
pub struct SlotGuard {
    semaphore: Arc<DistributedSemaphore>,
    token: SlotToken,
    released: bool,
}

impl SlotGuard {
    /// The underlying slot token.
    pub fn token(&self) -> &SlotToken {
        &self.token
    }

    /// Release the slot now.
    pub async fn release(mut self) {
        self.released = true;
        self.semaphore.release(&self.token).await;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released || self.token.backing == Backing::Local {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let semaphore = Arc::clone(&self.semaphore);
                let name = self.token.name.clone();
                let id = self.token.id.clone();
                runtime.spawn(async move {
                    semaphore.release_shared(&name, &id).await;
                });
            }
            Err(_) => {
                warn!(name = %self.token.name, "slot guard dropped outside a runtime, slot will expire by TTL");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use corral_store::InMemoryStore;

    use super::*;

    fn config(capacity: u32) -> SemaphoreConfig {
        SemaphoreConfig {
            default_capacity: capacity,
            poll_interval: Duration::from_millis(5),
            ..SemaphoreConfig::default()
        }
    }

    fn shared(capacity: u32) -> (Arc<InMemoryStore>, DistributedSemaphore) {
        let store = Arc::new(InMemoryStore::new());
        let semaphore = DistributedSemaphore::new(Some(store.clone()), config(capacity)).unwrap();
        (store, semaphore)
    }

    const TTL: Duration = Duration::from_secs(60);
    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn test_validate_rejects_zero_capacity() {
        assert!(config(0).validate().is_err());
        assert!(config(2).with_capacity("x", 0).validate().is_err());
        assert!(config(2).with_capacity("x", 5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_durations() {
        let too_long = Duration::from_millis(MAX_TTL_MS + 1);
        assert!(SemaphoreConfig { slot_ttl: too_long, ..config(1) }.validate().is_err());
        assert!(SemaphoreConfig { wait_timeout: Duration::MAX, ..config(1) }.validate().is_err());
        assert!(SemaphoreConfig { poll_interval: Duration::from_secs(61), ..config(1) }.validate().is_err());
    }

    #[tokio::test]
    async fn test_unbounded_arguments_do_not_panic() {
        let (_store, semaphore) = shared(1);
        let held = semaphore.try_acquire("browser", Duration::MAX, Duration::MAX).await.unwrap();
        assert_eq!(held.backing(), Backing::Shared);
        assert_eq!(semaphore.held("browser").await, 1);
        semaphore.release(&held).await;

        let local = DistributedSemaphore::new(None, config(1)).unwrap();
        let held = local.try_acquire("browser", Duration::MAX, Duration::MAX).await.unwrap();
        assert_eq!(held.backing(), Backing::Local);
        assert!(local.try_acquire("browser", Duration::MAX, NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (_store, semaphore) = shared(2);

        let a = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        let _b = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_none());
        assert_eq!(semaphore.held("browser").await, 2);

        semaphore.release(&a).await;
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_named_capacities_are_independent() {
        let store = Arc::new(InMemoryStore::new());
        let semaphore = DistributedSemaphore::new(Some(store), config(1).with_capacity("wide", 3)).unwrap();

        assert_eq!(semaphore.capacity("wide"), 3);
        assert_eq!(semaphore.capacity("narrow"), 1);
        for _ in 0..3 {
            assert!(semaphore.try_acquire("wide", TTL, NO_WAIT).await.is_some());
        }
        assert!(semaphore.try_acquire("narrow", TTL, NO_WAIT).await.is_some());
        assert!(semaphore.try_acquire("narrow", TTL, NO_WAIT).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_slot_stops_counting() {
        let (_store, semaphore) = shared(1);

        let _crashed = semaphore.try_acquire("browser", Duration::from_millis(20), NO_WAIT).await.unwrap();
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_none());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_slot_after_release() {
        let (_store, semaphore) = shared(1);
        let semaphore = Arc::new(semaphore);

        let held = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move { semaphore.try_acquire("browser", TTL, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        semaphore.release(&held).await;

        let token = waiter.await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (_store, semaphore) = shared(1);
        let _held = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();

        let start = Instant::now();
        assert!(semaphore.try_acquire("browser", TTL, Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(semaphore.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_store, semaphore) = shared(1);
        let token = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        semaphore.release(&token).await;
        semaphore.release(&token).await;
        assert_eq!(semaphore.held("browser").await, 0);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_local_permits() {
        let (store, semaphore) = shared(2);
        store.set_available(false);

        let a = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        let _b = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        assert_eq!(a.backing(), Backing::Local);
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_none());
        assert_eq!(semaphore.held("browser").await, 2);

        semaphore.release(&a).await;
        semaphore.release(&a).await;
        assert_eq!(semaphore.held("browser").await, 1);
        assert!(semaphore.metrics().store_errors >= 3);
        assert_eq!(semaphore.metrics().local_ops, 3);
    }

    #[tokio::test]
    async fn test_local_only_semaphore() {
        let semaphore = DistributedSemaphore::new(None, config(1)).unwrap();
        let held = semaphore.try_acquire("browser", TTL, NO_WAIT).await.unwrap();
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_none());
        drop(held);
        assert!(semaphore.try_acquire("browser", TTL, NO_WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_run_releases_slot() {
        let (_store, semaphore) = shared(1);
        let semaphore = Arc::new(semaphore);

        assert_eq!(semaphore.run("browser", || async { "done" }).await, Some("done"));
        assert_eq!(semaphore.held("browser").await, 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_shared_slot() {
        let (_store, semaphore) = shared(1);
        let semaphore = Arc::new(semaphore);

        let guard = semaphore.acquire_guard("browser").await.unwrap();
        drop(guard);
        let token = semaphore.try_acquire("browser", TTL, Duration::from_millis(500)).await;
        assert!(token.is_some());
    }
}
