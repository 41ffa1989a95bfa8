//! Coordination primitives for processes sharing a key-value store.
//!
//! - `DistributedMutex` - Mutual exclusion with owner tokens and TTLs
//! - `DistributedSemaphore` - Named counting semaphores with expiring slots
//! - `SoftRateLimiter` - Token bucket shared by every process using an id
//! - `StampedeCache` - Read-through cache with single-flight recomputation
//! - `LeaderLock` - Single-leader election with background renewal
//!
//! All primitives are built on the [`corral_store::SharedStore`] trait. Each
//! has a process-local fallback for when the store cannot be reached, with
//! strictly weaker guarantees; [`FallbackSnapshot`] counters make fallback
//! use observable. Failures are never surfaced as errors at runtime: an
//! acquisition that could not be granted returns `None` or `false`.
//!
//! ## Lock Example
//!
//! ```ignore
//! use corral_coordination::DistributedMutex;
//!
//! let mutex = Arc::new(DistributedMutex::new(store));
//! if let Some(guard) = mutex.lock("nightly-report", Duration::from_secs(300)).await {
//!     build_report().await;
//!     guard.release().await;
//! }
//! ```
//!
//! ## Leader Example
//!
//! ```ignore
//! use corral_coordination::{LeaderConfig, LeaderLock};
//!
//! let leader = LeaderLock::new("scheduler", mutex, LeaderConfig::default())?;
//! if leader.try_acquire().await {
//!     run_schedule(leader.subscribe()).await;
//!     leader.release().await;
//! }
//! ```

mod cache;
pub mod constants;
mod error;
mod leader;
mod metrics;
mod mutex;
mod rate_limiter;
mod semaphore;
mod types;
pub mod verified;

pub use cache::CacheConfig;
pub use cache::StampedeCache;
pub use error::CoordinationError;
pub use leader::LeaderConfig;
pub use leader::LeaderLock;
pub use leader::LeadershipState;
pub use metrics::FallbackMetrics;
pub use metrics::FallbackSnapshot;
pub use mutex::DistributedMutex;
pub use mutex::LockGuard;
pub use rate_limiter::RateLimiterConfig;
pub use rate_limiter::SoftRateLimiter;
pub use semaphore::DistributedSemaphore;
pub use semaphore::SemaphoreConfig;
pub use semaphore::SlotGuard;
pub use semaphore::SlotToken;
pub use types::Backing;
pub use types::LockHandle;
pub use types::now_unix_ms;
