//! Shared store client for corral's coordination primitives.
//!
//! The coordination layer needs very little from its store: plain reads and
//! writes with native TTLs, an atomic set-if-absent, and a handful of atomic
//! read-modify-write [`Script`]s. This crate defines that contract as the
//! [`SharedStore`] trait and ships two implementations:
//!
//! - [`RedisStore`] - the production backend, one Lua script per [`Script`]
//! - [`InMemoryStore`] - a process-local backend with the same semantics,
//!   used by tests and by the process-local fallbacks
//!
//! ## Key layout
//!
//! Keys are namespaced and colon separated; the layout is owned by the
//! callers in `corral-coordination`:
//!
//! ```text
//! lock:{key}                       owner token, native TTL
//! guard:{name}:slots               sorted set, member = token, score = expiry ms
//! bucket:{id}:tokens               token count
//! bucket:{id}:last_refill          last refill time, Unix ms
//! cache:{namespace}:{key}          cached value, native TTL
//! ```

mod error;
mod inmemory;
mod redis_store;
mod script;
mod traits;
pub mod verified;

pub use error::StoreError;
pub use inmemory::InMemoryStore;
pub use redis_store::RedisStore;
pub use script::BucketOutcome;
pub use script::Script;
pub use script::ScriptOutcome;
pub use traits::SharedStore;

/// Shared, type-erased handle to a store.
pub type SharedStoreRef = std::sync::Arc<dyn SharedStore>;
