//! Counters that make fallback usage observable.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Per-primitive operation counters.
///
/// Local fallbacks give strictly weaker guarantees than the shared store, so
/// every primitive counts how often it had to use one.
#[derive(Debug, Default)]
pub struct FallbackMetrics {
    shared_ops: AtomicU64,
    local_ops: AtomicU64,
    store_errors: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`FallbackMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FallbackSnapshot {
    /// Operations served by the shared store.
    pub shared_ops: u64,
    /// Operations served by the process-local fallback.
    pub local_ops: u64,
    /// Store calls that failed.
    pub store_errors: u64,
    /// Waits that ran out of budget.
    pub timeouts: u64,
}

impl FallbackMetrics {
    pub(crate) fn record_shared(&self) {
        self.shared_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_local(&self) {
        self.local_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> FallbackSnapshot {
        FallbackSnapshot {
            shared_ops: self.shared_ops.load(Ordering::Relaxed),
            local_ops: self.local_ops.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = FallbackMetrics::default();
        metrics.record_shared();
        metrics.record_shared();
        metrics.record_local();
        metrics.record_store_error();
        metrics.record_timeout();
        assert_eq!(metrics.snapshot(), FallbackSnapshot {
            shared_ops: 2,
            local_ops: 1,
            store_errors: 1,
            timeouts: 1,
        });
    }
}
