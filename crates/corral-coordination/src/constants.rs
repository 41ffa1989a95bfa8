//! Default values and fixed limits for the coordination primitives.
//!
//! Tiger Style: every configured wait, TTL and capacity has an explicit
//! default and an explicit upper bound, checked by each primitive's
//! `validate()`, so a bad configuration cannot create unbounded waits or
//! unbounded store state. Per-call arguments are not bounded; an oversized
//! wait or TTL passed directly to a primitive is treated as unbounded.

/// Default number of concurrent holders for a named semaphore guard.
pub const DEFAULT_SEMAPHORE_CAPACITY: u32 = 2;

/// Upper bound on any semaphore guard's capacity.
pub const MAX_SEMAPHORE_CAPACITY: u32 = 10_000;

/// Default lifetime of a semaphore slot (5 minutes).
///
/// Must exceed the longest guarded operation plus clock skew, otherwise a
/// live holder's slot expires under it.
pub const DEFAULT_SLOT_TTL_MS: u64 = 300_000;

/// Default time a caller waits for a semaphore slot.
pub const DEFAULT_ACQUIRE_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Default sleep between semaphore acquisition attempts.
pub const DEFAULT_SEMAPHORE_POLL_INTERVAL_MS: u64 = 100;

/// Default rate limiter interval: one token per second.
pub const DEFAULT_RATE_LIMIT_INTERVAL_MS: u64 = 1_000;

/// Default rate limiter burst capacity.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 1;

/// Default sleep between rate limiter attempts.
pub const DEFAULT_RATE_LIMIT_POLL_INTERVAL_MS: u64 = 50;

/// Default cache entry lifetime (1 hour).
pub const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;

/// Default lifetime of the recomputation lock for a cache key.
pub const DEFAULT_CACHE_LOCK_TTL_MS: u64 = 30_000;

/// Default time a follower waits for another process's recomputation.
pub const DEFAULT_CACHE_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Default sleep between cache polls while a follower waits.
pub const DEFAULT_CACHE_POLL_INTERVAL_MS: u64 = 100;

/// Default leader lock TTL (1 minute).
pub const DEFAULT_LEADER_TTL_MS: u64 = 60_000;

/// Default divisor for the leader renewal period: renew every TTL / 5.
pub const DEFAULT_LEADER_RENEWAL_DIVISOR: u32 = 5;

/// Smallest poll interval accepted; keeps every wait loop from spinning.
pub const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Upper bound on any configured poll interval (1 minute).
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Upper bound on any configured TTL: slot, lock, cache entry or leader term (30 days).
pub const MAX_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Upper bound on any configured wait timeout (1 hour).
pub const MAX_WAIT_TIMEOUT_MS: u64 = 3_600_000;

/// Upper bound on a rate limiter's refill interval (1 day).
pub const MAX_RATE_LIMIT_INTERVAL_MS: u64 = 86_400_000;

/// Upper bound on a rate limiter's burst.
pub const MAX_RATE_LIMIT_BURST: u32 = 1_000_000;

/// Upper bound on the leader renewal divisor.
pub const MAX_LEADER_RENEWAL_DIVISOR: u32 = 1_000;
