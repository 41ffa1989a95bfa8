//! Pure functions for coordination primitives.
//!
//! # Tiger Style
//!
//! - Uses saturating arithmetic for all calculations
//! - Time is passed explicitly (no calls to system time)
//! - Deterministic behavior for testing and verification

pub mod keys;
pub mod timing;

pub use keys::bucket_keys;
pub use keys::cache_key;
pub use keys::lock_key;
pub use keys::slots_key;
pub use timing::compute_expiry_ms;
pub use timing::deadline_after;
pub use timing::next_poll_delay;
pub use timing::renewal_interval;
