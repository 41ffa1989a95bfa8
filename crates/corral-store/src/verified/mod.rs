//! Pure functions behind the store-side atomic scripts.
//!
//! The Lua scripts run by [`RedisStore`](crate::RedisStore) and the closures
//! run by [`InMemoryStore`](crate::InMemoryStore) implement the same
//! read-modify-write steps. The arithmetic lives here so both backends, and
//! the process-local fallbacks in `corral-coordination`, agree on it.
//!
//! All functions are deterministic: time is always passed in explicitly.

pub mod bucket;
pub mod slots;

pub use bucket::BucketState;
pub use bucket::ConsumeDecision;
pub use bucket::consume_one;
pub use bucket::refill_tokens;
pub use bucket::refill_units;
pub use slots::can_add_slot;
pub use slots::count_live_slots;
pub use slots::is_slot_expired;
