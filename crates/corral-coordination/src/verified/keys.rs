//! Store key layout.
//!
//! Every key a primitive touches is built here so the layout is defined in
//! exactly one place:
//!
//! ```text
//! lock:{key}
//! guard:{name}:slots
//! bucket:{id}:tokens
//! bucket:{id}:last_refill
//! cache:{namespace}:{key}
//! ```

/// Key holding a mutex owner token.
#[inline]
pub fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// Key holding the slot set of a named semaphore guard.
#[inline]
pub fn slots_key(name: &str) -> String {
    format!("guard:{name}:slots")
}

/// Keys holding a rate limiter's token count and last refill time.
#[inline]
pub fn bucket_keys(id: &str) -> (String, String) {
    (format!("bucket:{id}:tokens"), format!("bucket:{id}:last_refill"))
}

/// Key holding a cached value.
///
/// The same string, passed through [`lock_key`], names the recomputation lock.
#[inline]
pub fn cache_key(namespace: &str, key: &str) -> String {
    format!("cache:{namespace}:{key}")
}
