//! Slot bookkeeping for the distributed semaphore.
//!
//! A slot is a member of a per-guard ordered set whose score is its expiry
//! time in Unix milliseconds. A member whose score is not in the future is
//! logically absent even before it is physically removed.

/// Check whether a slot with the given expiry has lapsed.
///
/// A slot expiring exactly at `now_ms` is already gone; this matches the
/// inclusive `ZREMRANGEBYSCORE -inf now` prune in the Redis script.
#[inline]
pub fn is_slot_expired(expires_at_ms: u64, now_ms: u64) -> bool {
    expires_at_ms <= now_ms
}

/// Count the slots that are still live at `now_ms`.
#[inline]
pub fn count_live_slots<I>(expiries: I, now_ms: u64) -> u64
where I: IntoIterator<Item = u64> {
    expiries.into_iter().filter(|expires_at_ms| !is_slot_expired(*expires_at_ms, now_ms)).count() as u64
}

/// Check whether one more slot fits under `capacity`.
#[inline]
pub fn can_add_slot(live_slots: u64, capacity: u32) -> bool {
    live_slots < u64::from(capacity)
}
