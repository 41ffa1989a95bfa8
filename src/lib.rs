//! Corral: distributed concurrency control for worker processes sharing a
//! key-value store.
//!
//! [`Corral`] connects to the store described by a [`CorralConfig`] and hands
//! out the coordination primitives from [`corral_coordination`]:
//!
//! - a [`DistributedMutex`] for one-at-a-time work
//! - a [`DistributedSemaphore`] of named guards for bounded concurrency
//! - [`SoftRateLimiter`]s for token-bucket throttling
//! - [`StampedeCache`]s for single-flight recomputation of cached values
//! - [`LeaderLock`]s for single-leader roles
//!
//! If the store is absent or unreachable, every primitive falls back to
//! process-local state with weaker, per-process guarantees.
//!
//! ```ignore
//! let corral = Corral::connect(CorralConfig::load(Some(Path::new("corral.toml")))?).await?;
//! let browsers = corral.semaphore();
//! browsers.run("browser", || render(page)).await;
//! ```

pub mod config;
mod corral;

pub use config::ConfigError;
pub use config::CorralConfig;
pub use corral::Corral;
pub use corral_coordination::Backing;
pub use corral_coordination::CacheConfig;
pub use corral_coordination::CoordinationError;
pub use corral_coordination::DistributedMutex;
pub use corral_coordination::DistributedSemaphore;
pub use corral_coordination::FallbackSnapshot;
pub use corral_coordination::LeaderConfig;
pub use corral_coordination::LeaderLock;
pub use corral_coordination::LeadershipState;
pub use corral_coordination::LockGuard;
pub use corral_coordination::LockHandle;
pub use corral_coordination::RateLimiterConfig;
pub use corral_coordination::SemaphoreConfig;
pub use corral_coordination::SlotGuard;
pub use corral_coordination::SlotToken;
pub use corral_coordination::SoftRateLimiter;
pub use corral_coordination::StampedeCache;
pub use corral_store::InMemoryStore;
pub use corral_store::RedisStore;
pub use corral_store::SharedStore;
pub use corral_store::SharedStoreRef;
pub use corral_store::StoreError;
