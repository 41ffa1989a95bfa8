//! Shared types for coordination primitives.

use uuid::Uuid;

/// Where a hold (lock or slot) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// In the shared store; visible to every process.
    Shared,
    /// In process-local fallback state; visible to this process only.
    Local,
}

impl std::fmt::Display for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backing::Shared => write!(f, "shared"),
            Backing::Local => write!(f, "local"),
        }
    }
}

/// Proof of holding a [`DistributedMutex`](crate::DistributedMutex) lock.
///
/// Ownership is established by the random token alone, never by the key's
/// presence: once the lock expires and someone else takes it, this handle's
/// renew and release calls become no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub(crate) key: String,
    pub(crate) token: String,
    pub(crate) backing: Backing,
    pub(crate) acquired_at_ms: u64,
}

impl LockHandle {
    /// The logical lock key (without the `lock:` prefix).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner token stored under the lock key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lock is held in the shared store or locally.
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// When the lock was acquired (Unix milliseconds).
    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }
}

/// Generate a fresh random owner token.
pub(crate) fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch instead of panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_unix_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_backing_display() {
        assert_eq!(Backing::Shared.to_string(), "shared");
        assert_eq!(Backing::Local.to_string(), "local");
    }
}
