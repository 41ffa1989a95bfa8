//! Atomic server-side operations.
//!
//! Every coordination invariant that needs a read followed by a write is
//! expressed as one [`Script`]. Backends must execute each script as a single
//! atomic step: Redis runs a Lua script, the in-memory store holds its lock
//! for the whole evaluation. A client-side read then write is never used.

use crate::error::StoreError;

/// A read-modify-write executed atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Extend the TTL of `key` only if it still holds `token`.
    RenewIfOwner {
        /// Lock key.
        key: String,
        /// Owner token the caller believes it holds.
        token: String,
        /// New TTL in milliseconds.
        ttl_ms: u64,
    },
    /// Delete `key` only if it still holds `token`.
    DeleteIfOwner {
        /// Lock key.
        key: String,
        /// Owner token the caller believes it holds.
        token: String,
    },
    /// Prune expired slots, then add `member` if fewer than `capacity` remain.
    ///
    /// The set itself expires with its latest slot so an idle guard
    /// disappears from the store.
    AcquireSlot {
        /// Slot set key.
        key: String,
        /// Random member identifying the new slot.
        member: String,
        /// Maximum number of live slots.
        capacity: u32,
        /// Current time in Unix milliseconds.
        now_ms: u64,
        /// Expiry of the new slot in Unix milliseconds.
        expires_at_ms: u64,
    },
    /// Remove `member` from the slot set. Absent members are a no-op.
    ReleaseSlot {
        /// Slot set key.
        key: String,
        /// Member to remove.
        member: String,
    },
    /// Count slots that are live at `now_ms`.
    CountSlots {
        /// Slot set key.
        key: String,
        /// Current time in Unix milliseconds.
        now_ms: u64,
    },
    /// Refill a token bucket and try to take one token.
    ConsumeToken {
        /// Key holding the token count.
        tokens_key: String,
        /// Key holding the last refill time.
        last_refill_key: String,
        /// Bucket capacity.
        burst: u32,
        /// Milliseconds per refilled token.
        interval_ms: u64,
        /// Current time in Unix milliseconds.
        now_ms: u64,
    },
}

impl Script {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Script::RenewIfOwner { .. } => "renew_if_owner",
            Script::DeleteIfOwner { .. } => "delete_if_owner",
            Script::AcquireSlot { .. } => "acquire_slot",
            Script::ReleaseSlot { .. } => "release_slot",
            Script::CountSlots { .. } => "count_slots",
            Script::ConsumeToken { .. } => "consume_token",
        }
    }
}

/// Outcome of a token bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was taken.
    pub acquired: bool,
    /// Tokens left in the bucket.
    pub tokens: f64,
}

/// Reply from [`SharedStore::eval`](crate::SharedStore::eval).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptOutcome {
    /// Whether a conditional mutation was applied.
    Applied(bool),
    /// A count of live members.
    Count(u64),
    /// A token bucket step.
    Bucket(BucketOutcome),
}

impl ScriptOutcome {
    /// Unwrap an [`ScriptOutcome::Applied`] reply.
    pub fn into_applied(self, script: &'static str) -> Result<bool, StoreError> {
        match self {
            ScriptOutcome::Applied(applied) => Ok(applied),
            other => Err(unexpected(script, "applied", other)),
        }
    }

    /// Unwrap a [`ScriptOutcome::Count`] reply.
    pub fn into_count(self, script: &'static str) -> Result<u64, StoreError> {
        match self {
            ScriptOutcome::Count(count) => Ok(count),
            other => Err(unexpected(script, "count", other)),
        }
    }

    /// Unwrap a [`ScriptOutcome::Bucket`] reply.
    pub fn into_bucket(self, script: &'static str) -> Result<BucketOutcome, StoreError> {
        match self {
            ScriptOutcome::Bucket(outcome) => Ok(outcome),
            other => Err(unexpected(script, "bucket", other)),
        }
    }
}

fn unexpected(script: &'static str, expected: &str, got: ScriptOutcome) -> StoreError {
    StoreError::UnexpectedReply {
        script,
        reason: format!("expected {expected} reply, got {got:?}"),
    }
}
