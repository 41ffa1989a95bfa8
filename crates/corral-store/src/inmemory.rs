//! Process-local implementation of [`SharedStore`].
//!
//! Used in two roles: as the deterministic store for tests that model several
//! processes sharing one backend, and as the process-local backend behind the
//! mutex and cache fallbacks when the shared store is absent.
//!
//! Every operation, scripts included, runs under a single lock, which gives
//! the same atomicity a Redis Lua script gets from the server.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::script::BucketOutcome;
use crate::script::Script;
use crate::script::ScriptOutcome;
use crate::traits::SharedStore;
use crate::verified;
use crate::verified::BucketState;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    /// Member -> expiry score (Unix milliseconds).
    Slots(HashMap<String, u64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Expiry of an entry written at `now` with `ttl`.
///
/// A TTL too large to represent means the entry never expires.
fn expiry_after(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Expired entries are swept after this many writes.
const SWEEP_EVERY_WRITES: u32 = 1_024;

/// Expired entries are swept on the first write after this long.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,
    writes_since_sweep: u32,
    last_sweep: Instant,
}

impl State {
    /// Count a write and drop every expired entry when a sweep is due.
    fn record_write(&mut self, now: Instant) {
        self.writes_since_sweep = self.writes_since_sweep.saturating_add(1);
        let due = self.writes_since_sweep >= SWEEP_EVERY_WRITES
            || now.saturating_duration_since(self.last_sweep) >= SWEEP_INTERVAL;
        if due {
            self.entries.retain(|_, entry| !entry.is_expired(now));
            self.writes_since_sweep = 0;
            self.last_sweep = now;
        }
    }
}

/// In-memory store with store-native TTLs and failure injection.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryStore::new());
/// let mutex = DistributedMutex::new(store.clone());
/// store.set_available(false); // every call now fails with Unavailable
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                writes_since_sweep: 0,
                last_sweep: Instant::now(),
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the store currently answers requests.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of unexpired keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.state.lock().entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Number of stored keys, expired or not.
    pub fn stored_key_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            })
        }
    }

    fn purge_if_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
    }

    fn read_bytes(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<Vec<u8>> {
        Self::purge_if_expired(entries, key, now);
        match entries.get(key) {
            Some(Entry {
                value: StoredValue::Bytes(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn parse_number<T: std::str::FromStr>(bytes: Option<Vec<u8>>) -> Option<T> {
        let bytes = bytes?;
        std::str::from_utf8(&bytes).ok()?.trim().parse().ok()
    }

    fn run_script(entries: &mut HashMap<String, Entry>, script: Script) -> Result<ScriptOutcome, StoreError> {
        let now = Instant::now();
        match script {
            Script::RenewIfOwner { key, token, ttl_ms } => {
                Self::purge_if_expired(entries, &key, now);
                match entries.get_mut(&key) {
                    Some(entry) if matches!(&entry.value, StoredValue::Bytes(b) if b.as_slice() == token.as_bytes()) => {
                        entry.expires_at = expiry_after(now, Duration::from_millis(ttl_ms));
                        Ok(ScriptOutcome::Applied(true))
                    }
                    _ => Ok(ScriptOutcome::Applied(false)),
                }
            }
            Script::DeleteIfOwner { key, token } => {
                let owned = Self::read_bytes(entries, &key, now).is_some_and(|b| b == token.as_bytes());
                if owned {
                    entries.remove(&key);
                }
                Ok(ScriptOutcome::Applied(owned))
            }
            Script::AcquireSlot {
                key,
                member,
                capacity,
                now_ms,
                expires_at_ms,
            } => {
                Self::purge_if_expired(entries, &key, now);
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: StoredValue::Slots(HashMap::new()),
                    expires_at: None,
                });
                let StoredValue::Slots(slots) = &mut entry.value else {
                    return Err(wrong_type("acquire_slot", &key));
                };
                slots.retain(|_, expires| !verified::is_slot_expired(*expires, now_ms));
                let live = verified::count_live_slots(slots.values().copied(), now_ms);
                if !verified::can_add_slot(live, capacity) {
                    if slots.is_empty() {
                        entries.remove(&key);
                    }
                    return Ok(ScriptOutcome::Applied(false));
                }
                slots.insert(member, expires_at_ms);
                let latest_ms = slots.values().copied().max().unwrap_or(expires_at_ms);
                entry.expires_at = expiry_after(now, Duration::from_millis(latest_ms.saturating_sub(now_ms)));
                Ok(ScriptOutcome::Applied(true))
            }
            Script::ReleaseSlot { key, member } => {
                Self::purge_if_expired(entries, &key, now);
                match entries.get_mut(&key) {
                    Some(Entry {
                        value: StoredValue::Slots(slots),
                        ..
                    }) => Ok(ScriptOutcome::Applied(slots.remove(&member).is_some())),
                    Some(_) => Err(wrong_type("release_slot", &key)),
                    None => Ok(ScriptOutcome::Applied(false)),
                }
            }
            Script::CountSlots { key, now_ms } => {
                Self::purge_if_expired(entries, &key, now);
                match entries.get(&key) {
                    Some(Entry {
                        value: StoredValue::Slots(slots),
                        ..
                    }) => Ok(ScriptOutcome::Count(verified::count_live_slots(slots.values().copied(), now_ms))),
                    Some(_) => Err(wrong_type("count_slots", &key)),
                    None => Ok(ScriptOutcome::Count(0)),
                }
            }
            Script::ConsumeToken {
                tokens_key,
                last_refill_key,
                burst,
                interval_ms,
                now_ms,
            } => {
                let tokens: Option<f64> = Self::parse_number(Self::read_bytes(entries, &tokens_key, now));
                let last_refill_ms: Option<u64> = Self::parse_number(Self::read_bytes(entries, &last_refill_key, now));
                let state = match (tokens, last_refill_ms) {
                    (Some(tokens), Some(last_refill_ms)) => Some(BucketState { tokens, last_refill_ms }),
                    _ => None,
                };
                let decision = verified::consume_one(state, burst, interval_ms, now_ms);
                if decision.acquired {
                    for (key, value) in [
                        (tokens_key, decision.tokens.to_string()),
                        (last_refill_key, decision.last_refill_ms.to_string()),
                    ] {
                        entries.insert(key, Entry {
                            value: StoredValue::Bytes(value.into_bytes()),
                            expires_at: None,
                        });
                    }
                }
                Ok(ScriptOutcome::Bucket(BucketOutcome {
                    acquired: decision.acquired,
                    tokens: decision.tokens,
                }))
            }
        }
    }
}

fn wrong_type(script: &'static str, key: &str) -> StoreError {
    StoreError::UnexpectedReply {
        script,
        reason: format!("key '{key}' holds the wrong kind of value"),
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let entries = &mut state.entries;
        let now = Instant::now();
        Self::purge_if_expired(entries, key, now);
        match entries.get(key) {
            Some(Entry {
                value: StoredValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type("get", key)),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        state.entries.insert(key.to_string(), Entry {
            value: StoredValue::Bytes(value.to_vec()),
            expires_at: expiry_after(now, ttl),
        });
        state.record_write(now);
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        Self::purge_if_expired(&mut state.entries, key, now);
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(key.to_string(), Entry {
            value: StoredValue::Bytes(value.to_vec()),
            expires_at: expiry_after(now, ttl),
        });
        state.record_write(now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        Self::purge_if_expired(&mut state.entries, key, Instant::now());
        Ok(state.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        Self::purge_if_expired(&mut state.entries, key, Instant::now());
        Ok(state.entries.contains_key(key))
    }

    async fn eval(&self, script: Script) -> Result<ScriptOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let outcome = Self::run_script(&mut state.entries, script);
        state.record_write(Instant::now());
        outcome
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire_slot(member: &str, capacity: u32, now_ms: u64) -> Script {
        Script::AcquireSlot {
            key: "guard:test:slots".to_string(),
            member: member.to_string(),
            capacity,
            now_ms,
            expires_at_ms: now_ms + 60_000,
        }
    }

    #[tokio::test]
    async fn test_set_if_not_exists_is_exclusive() {
        let store = InMemoryStore::new();
        assert!(store.set_if_not_exists("lock:a", b"t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_not_exists("lock:a", b"t2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some(b"t1".to_vec()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store.set_with_ttl("k", b"v", Duration::from_millis(20)).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_renew_and_delete_require_owner() {
        let store = InMemoryStore::new();
        store.set_if_not_exists("lock:a", b"owner", Duration::from_secs(5)).await.unwrap();

        let renew = |token: &str| Script::RenewIfOwner {
            key: "lock:a".to_string(),
            token: token.to_string(),
            ttl_ms: 10_000,
        };
        assert!(!store.eval(renew("intruder")).await.unwrap().into_applied("r").unwrap());
        assert!(store.eval(renew("owner")).await.unwrap().into_applied("r").unwrap());

        let delete = |token: &str| Script::DeleteIfOwner {
            key: "lock:a".to_string(),
            token: token.to_string(),
        };
        assert!(!store.eval(delete("intruder")).await.unwrap().into_applied("d").unwrap());
        assert!(store.exists("lock:a").await.unwrap());
        assert!(store.eval(delete("owner")).await.unwrap().into_applied("d").unwrap());
        assert!(!store.exists("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_slots_respect_capacity() {
        let store = InMemoryStore::new();
        assert!(store.eval(acquire_slot("a", 2, 1000)).await.unwrap().into_applied("s").unwrap());
        assert!(store.eval(acquire_slot("b", 2, 1000)).await.unwrap().into_applied("s").unwrap());
        assert!(!store.eval(acquire_slot("c", 2, 1000)).await.unwrap().into_applied("s").unwrap());

        let count = Script::CountSlots {
            key: "guard:test:slots".to_string(),
            now_ms: 1000,
        };
        assert_eq!(store.eval(count).await.unwrap().into_count("c").unwrap(), 2);

        let release = Script::ReleaseSlot {
            key: "guard:test:slots".to_string(),
            member: "a".to_string(),
        };
        assert!(store.eval(release.clone()).await.unwrap().into_applied("r").unwrap());
        assert!(!store.eval(release).await.unwrap().into_applied("r").unwrap());
        assert!(store.eval(acquire_slot("c", 2, 1000)).await.unwrap().into_applied("s").unwrap());
    }

    #[tokio::test]
    async fn test_expired_slots_are_pruned() {
        let store = InMemoryStore::new();
        assert!(store.eval(acquire_slot("a", 1, 1000)).await.unwrap().into_applied("s").unwrap());
        // 61s later the first slot's score is in the past.
        assert!(store.eval(acquire_slot("b", 1, 62_000)).await.unwrap().into_applied("s").unwrap());
    }

    #[tokio::test]
    async fn test_short_slot_does_not_shorten_set_lifetime() {
        let store = InMemoryStore::new();
        let now_ms = 1_000;
        let slot = |member: &str, ttl_ms: u64| Script::AcquireSlot {
            key: "guard:test:slots".to_string(),
            member: member.to_string(),
            capacity: 5,
            now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };
        store.eval(slot("long", 60_000)).await.unwrap();
        store.eval(slot("short", 10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let count = Script::CountSlots {
            key: "guard:test:slots".to_string(),
            now_ms,
        };
        assert_eq!(store.eval(count).await.unwrap().into_count("c").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_oversized_ttl_never_expires() {
        let store = InMemoryStore::new();
        store.set_with_ttl("forever", b"v", Duration::MAX).await.unwrap();
        assert!(store.set_if_not_exists("lock:a", b"owner", Duration::MAX).await.unwrap());

        let renew = Script::RenewIfOwner {
            key: "lock:a".to_string(),
            token: "owner".to_string(),
            ttl_ms: u64::MAX,
        };
        assert!(store.eval(renew).await.unwrap().into_applied("r").unwrap());

        let slot = Script::AcquireSlot {
            key: "guard:test:slots".to_string(),
            member: "a".to_string(),
            capacity: 1,
            now_ms: 1_000,
            expires_at_ms: u64::MAX,
        };
        assert!(store.eval(slot).await.unwrap().into_applied("s").unwrap());

        assert!(store.exists("forever").await.unwrap());
        assert!(store.exists("lock:a").await.unwrap());
        assert!(store.exists("guard:test:slots").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept_on_write() {
        let store = InMemoryStore::new();
        for i in 0..10_000 {
            store.set_with_ttl(&format!("cache:users:{i}"), b"v", Duration::from_millis(1)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..SWEEP_EVERY_WRITES {
            store.set_with_ttl("unrelated", b"v", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.stored_key_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_token_shares_bucket() {
        let store = InMemoryStore::new();
        let consume = |now_ms| Script::ConsumeToken {
            tokens_key: "bucket:api:tokens".to_string(),
            last_refill_key: "bucket:api:last_refill".to_string(),
            burst: 2,
            interval_ms: 1000,
            now_ms,
        };
        assert!(store.eval(consume(5000)).await.unwrap().into_bucket("b").unwrap().acquired);
        assert!(store.eval(consume(5000)).await.unwrap().into_bucket("b").unwrap().acquired);
        assert!(!store.eval(consume(5000)).await.unwrap().into_bucket("b").unwrap().acquired);
        let outcome = store.eval(consume(6000)).await.unwrap().into_bucket("b").unwrap();
        assert!(outcome.acquired);
        assert_eq!(outcome.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.set_if_not_exists("k", b"v", Duration::from_secs(1)).await.is_err());
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_on_slot_set_is_wrong_type() {
        let store = InMemoryStore::new();
        store.eval(acquire_slot("a", 1, 1000)).await.unwrap();
        let err = store.get("guard:test:slots").await.unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedReply { .. }));
    }
}
