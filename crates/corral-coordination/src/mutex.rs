//! Distributed mutual exclusion with owner tokens.
//!
//! A lock is a single store key, `lock:{key}`, holding a random owner token
//! with a native TTL. Acquisition is one atomic set-if-absent. Renewal and
//! release are compare-and-act scripts that only touch the key while it
//! still holds the caller's token, so a holder whose lock expired can never
//! extend or delete a lock that somebody else has since taken.
//!
//! When the shared store fails during acquisition the attempt is treated as
//! not acquired: granting a lock the store never recorded could put two
//! processes in the critical section. Failures during renewal and release
//! are logged and swallowed; the TTL bounds how long a stale lock can live.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use corral_store::InMemoryStore;
use corral_store::Script;
use corral_store::SharedStore;
use corral_store::SharedStoreRef;
use tracing::debug;
use tracing::warn;

use crate::metrics::FallbackMetrics;
use crate::metrics::FallbackSnapshot;
use crate::types::Backing;
use crate::types::LockHandle;
use crate::types::new_token;
use crate::types::now_unix_ms;
use crate::verified;

/// Mutual exclusion across processes sharing a store.
///
/// Without a shared store the same protocol runs against a process-local
/// [`InMemoryStore`], which excludes tasks of this process only.
pub struct DistributedMutex {
    shared: Option<SharedStoreRef>,
    local: Arc<InMemoryStore>,
    metrics: FallbackMetrics,
}

impl DistributedMutex {
    /// Create a mutex backed by a shared store.
    pub fn new(store: SharedStoreRef) -> Self {
        Self::with_store(Some(store))
    }

    /// Create a mutex that only excludes tasks within this process.
    pub fn local_only() -> Self {
        Self::with_store(None)
    }

    /// Create a mutex from an optional shared store.
    pub fn with_store(store: Option<SharedStoreRef>) -> Self {
        Self {
            shared: store,
            local: Arc::new(InMemoryStore::new()),
            metrics: FallbackMetrics::default(),
        }
    }

    /// Whether locks are taken in a shared store.
    pub fn is_distributed(&self) -> bool {
        self.shared.is_some()
    }

    /// Operation counters.
    pub fn metrics(&self) -> FallbackSnapshot {
        self.metrics.snapshot()
    }

    fn store_for(&self, backing: Backing) -> &dyn SharedStore {
        match (backing, &self.shared) {
            (Backing::Shared, Some(store)) => store.as_ref(),
            _ => self.local.as_ref(),
        }
    }

    /// Try once to take the lock on `key` for `ttl`.
    ///
    /// Returns `None` if someone else holds it or if the store could not be
    /// consulted.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let backing = if self.shared.is_some() {
            self.metrics.record_shared();
            Backing::Shared
        } else {
            self.metrics.record_local();
            Backing::Local
        };
        let store_key = verified::lock_key(key);
        let token = new_token();

        match self.store_for(backing).set_if_not_exists(&store_key, token.as_bytes(), ttl).await {
            Ok(true) => {
                debug!(key, %backing, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                Some(LockHandle {
                    key: key.to_string(),
                    token,
                    backing,
                    acquired_at_ms: now_unix_ms(),
                })
            }
            Ok(false) => {
                debug!(key, "lock held by another owner");
                None
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key, error = %e, "lock acquisition failed, treating as not acquired");
                None
            }
        }
    }

    /// Extend a held lock to expire `ttl` from now.
    ///
    /// Returns false if the lock is no longer owned by `handle` or the store
    /// could not be reached; the caller must assume it lost the lock.
    pub async fn renew(&self, handle: &LockHandle, ttl: Duration) -> bool {
        let script = Script::RenewIfOwner {
            key: verified::lock_key(&handle.key),
            token: handle.token.clone(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let name = script.name();
        match self.store_for(handle.backing).eval(script).await.and_then(|o| o.into_applied(name)) {
            Ok(true) => {
                debug!(key = %handle.key, ttl_ms = ttl.as_millis() as u64, "lock renewed");
                true
            }
            Ok(false) => {
                warn!(key = %handle.key, "lock renewal refused, ownership lost");
                false
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %handle.key, error = %e, "lock renewal failed");
                false
            }
        }
    }

    /// Release a held lock.
    ///
    /// Deletes the key only if it still holds this handle's token. Releasing
    /// twice, or after expiry, is a no-op.
    pub async fn release(&self, handle: &LockHandle) {
        let script = Script::DeleteIfOwner {
            key: verified::lock_key(&handle.key),
            token: handle.token.clone(),
        };
        let name = script.name();
        match self.store_for(handle.backing).eval(script).await.and_then(|o| o.into_applied(name)) {
            Ok(true) => debug!(key = %handle.key, "lock released"),
            Ok(false) => debug!(key = %handle.key, "lock already expired or taken over, nothing to release"),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %handle.key, error = %e, "lock release failed, lock will expire by TTL");
            }
        }
    }

    /// Try once to take the lock and wrap it in a guard that releases on drop.
    pub async fn lock(self: &Arc<Self>, key: &str, ttl: Duration) -> Option<LockGuard> {
        let handle = self.try_acquire(key, ttl).await?;
        Some(LockGuard {
            mutex: Arc::clone(self),
            handle,
            released: false,
        })
    }

    /// Run `f` while holding the lock on `key`.
    ///
    /// Returns `None` without running `f` if the lock could not be taken.
    /// The lock is released when `f` completes, and also if the returned
    /// future is dropped or `f` panics.
    pub async fn with_lock<F, Fut, T>(self: &Arc<Self>, key: &str, ttl: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(key, ttl).await?;
        let output = f().await;
        guard.release().await;
        Some(output)
    }
}

/// A held lock that is released when dropped.
///
/// Prefer [`LockGuard::release`], which waits for the store to confirm.
/// Dropping the guard spawns the release onto the current Tokio runtime;
/// outside a runtime the lock is left to expire by TTL.
pub struct LockGuard {
    mutex: Arc<DistributedMutex>,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    /// The underlying lock handle.
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Extend the lock. See [`DistributedMutex::renew`].
    pub async fn renew(&self, ttl: Duration) -> bool {
        self.mutex.renew(&self.handle, ttl).await
    }

    /// Release the lock now.
    pub async fn release(mut self) {
        self.released = true;
        self.mutex.release(&self.handle).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mutex = Arc::clone(&self.mutex);
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    mutex.release(&handle).await;
                });
            }
            Err(_) => {
                warn!(key = %self.handle.key, "lock guard dropped outside a runtime, lock will expire by TTL");
            }
        }
    }
}
