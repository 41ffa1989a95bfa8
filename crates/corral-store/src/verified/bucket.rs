//! Token bucket refill and consumption.
//!
//! Refill is floor-based: a bucket gains one whole token per full `interval`
//! elapsed since the last successful consumption, capped at `burst`. The
//! token count is clamped to `[0, burst]` at every step so that a corrupted
//! or hand-edited stored value cannot push it out of range.

/// Bucket state as persisted by the store or held by a local fallback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently available.
    pub tokens: f64,
    /// Time of the last successful consumption (Unix milliseconds).
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A full bucket created at `now_ms`.
    pub fn full(burst: u32, now_ms: u64) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill_ms: now_ms,
        }
    }
}

/// Result of one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeDecision {
    /// Whether a token was taken.
    pub acquired: bool,
    /// Tokens left after the step.
    pub tokens: f64,
    /// Value to persist as the last refill time.
    pub last_refill_ms: u64,
}

/// Number of whole intervals elapsed between `last_refill_ms` and `now_ms`.
///
/// A clock that moved backwards yields zero rather than underflowing.
#[inline]
pub fn refill_units(last_refill_ms: u64, now_ms: u64, interval_ms: u64) -> u64 {
    let elapsed_ms = now_ms.saturating_sub(last_refill_ms);
    elapsed_ms / interval_ms.max(1)
}

/// Tokens available after refilling, clamped to `[0, burst]`.
#[inline]
pub fn refill_tokens(tokens: f64, last_refill_ms: u64, now_ms: u64, interval_ms: u64, burst: u32) -> f64 {
    let units = refill_units(last_refill_ms, now_ms, interval_ms) as f64;
    let tokens = if tokens.is_finite() { tokens } else { 0.0 };
    (tokens + units).clamp(0.0, f64::from(burst))
}

/// Refill the bucket and try to take one token.
///
/// A bucket that does not exist yet starts full. On success the last refill
/// time moves to `now_ms`; on failure it is left untouched so elapsed time
/// keeps accumulating towards the next whole token.
pub fn consume_one(state: Option<BucketState>, burst: u32, interval_ms: u64, now_ms: u64) -> ConsumeDecision {
    let state = state.unwrap_or_else(|| BucketState::full(burst, now_ms));
    let available = refill_tokens(state.tokens, state.last_refill_ms, now_ms, interval_ms, burst);

    if available >= 1.0 {
        ConsumeDecision {
            acquired: true,
            tokens: available - 1.0,
            last_refill_ms: now_ms,
        }
    } else {
        ConsumeDecision {
            acquired: false,
            tokens: available,
            last_refill_ms: state.last_refill_ms,
        }
    }
}
