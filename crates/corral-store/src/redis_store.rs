//! Redis-backed [`SharedStore`].
//!
//! Plain operations map to single Redis commands (`GET`, `SET .. PX`,
//! `SET .. NX PX`, `DEL`, `EXISTS`). Read-modify-write operations run as Lua
//! scripts, which Redis executes atomically. Scripts are loaded once per
//! store; `redis::Script` invokes them with `EVALSHA` and falls back to
//! `EVAL` when the server has not cached them yet.
//!
//! Every round trip is bounded by the store's operation timeout so that an
//! unreachable server turns into [`StoreError::Timeout`] instead of a hang.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::StoreError;
use crate::script::BucketOutcome;
use crate::script::Script;
use crate::script::ScriptOutcome;
use crate::traits::SharedStore;

/// KEYS[1] = lock key; ARGV[1] = token, ARGV[2] = ttl ms.
const RENEW_IF_OWNER_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// KEYS[1] = lock key; ARGV[1] = token.
const DELETE_IF_OWNER_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] = slot set; ARGV[1] = member, ARGV[2] = capacity,
/// ARGV[3] = now ms, ARGV[4] = slot expiry ms, ARGV[5] = longest set TTL ms.
///
/// The set lives until its latest slot expires.
const ACQUIRE_SLOT_LUA: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[3])
local held = redis.call('ZCARD', KEYS[1])
if held < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
    local latest = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
    local ttl = math.min(tonumber(latest[2]) - tonumber(ARGV[3]), tonumber(ARGV[5]))
    if ttl > 0 then
        redis.call('PEXPIRE', KEYS[1], math.floor(ttl))
    end
    return 1
end
return 0
"#;

/// KEYS[1] = tokens, KEYS[2] = last refill; ARGV[1] = burst,
/// ARGV[2] = interval ms, ARGV[3] = now ms.
///
/// Mirrors `verified::consume_one`. Returns {acquired, tokens-as-string}.
const CONSUME_TOKEN_LUA: &str = r#"
local burst = tonumber(ARGV[1])
local interval = math.max(1, tonumber(ARGV[2]))
local now = tonumber(ARGV[3])
local tokens = tonumber(redis.call('GET', KEYS[1]))
local last = tonumber(redis.call('GET', KEYS[2]))
if tokens == nil or last == nil then
    tokens = burst
    last = now
end
local units = math.floor(math.max(0, now - last) / interval)
tokens = math.max(0, math.min(burst, tokens + units))
if tokens >= 1 then
    tokens = tokens - 1
    redis.call('SET', KEYS[1], tostring(tokens))
    redis.call('SET', KEYS[2], tostring(now))
    return {1, tostring(tokens)}
end
return {0, tostring(tokens)}
"#;

/// Longest TTL sent to the server (100 years); larger values overflow
/// Redis' expiry arithmetic and are rejected.
const MAX_TTL_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

struct Scripts {
    renew_if_owner: redis::Script,
    delete_if_owner: redis::Script,
    acquire_slot: redis::Script,
    consume_token: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            renew_if_owner: redis::Script::new(RENEW_IF_OWNER_LUA),
            delete_if_owner: redis::Script::new(DELETE_IF_OWNER_LUA),
            acquire_slot: redis::Script::new(ACQUIRE_SLOT_LUA),
            consume_token: redis::Script::new(CONSUME_TOKEN_LUA),
        }
    }
}

/// Shared store backed by a Redis server.
///
/// Cloning is cheap: the connection manager multiplexes one connection and
/// reconnects on its own after failures.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis at `url` (for example `redis://127.0.0.1:6379/`).
    ///
    /// `op_timeout` bounds every subsequent round trip, and the initial
    /// connection attempt.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let manager = match tokio::time::timeout(op_timeout, ConnectionManager::new(client)).await {
            Ok(manager) => manager?,
            Err(_) => {
                return Err(StoreError::Timeout {
                    operation: "connect".to_string(),
                    duration_ms: op_timeout.as_millis() as u64,
                });
            }
        };
        debug!(url, timeout_ms = op_timeout.as_millis() as u64, "connected to redis");
        Ok(Self {
            manager,
            scripts: std::sync::Arc::new(Scripts::load()),
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, StoreError>
    where F: Future<Output = redis::RedisResult<T>> + Send {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                operation: operation.to_string(),
                duration_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    clamp_ttl_ms(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}

fn clamp_ttl_ms(ttl_ms: u64) -> u64 {
    ttl_ms.clamp(1, MAX_TTL_MS)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.bounded("GET", async move { cmd.query_async(&mut conn).await }).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        self.bounded("SET", async move { cmd.query_async(&mut conn).await }).await
    }

    async fn set_if_not_exists(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl));
        let reply: Option<String> = self.bounded("SET NX", async move { cmd.query_async(&mut conn).await }).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.bounded("DEL", async move { cmd.query_async(&mut conn).await }).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: u64 = self.bounded("EXISTS", async move { cmd.query_async(&mut conn).await }).await?;
        Ok(count > 0)
    }

    async fn eval(&self, script: Script) -> Result<ScriptOutcome, StoreError> {
        let name = script.name();
        let mut conn = self.manager.clone();
        let scripts = self.scripts.clone();

        match script {
            Script::RenewIfOwner { key, token, ttl_ms } => {
                let applied: i64 = self
                    .bounded(name, async move {
                        scripts.renew_if_owner.key(key).arg(token).arg(clamp_ttl_ms(ttl_ms)).invoke_async(&mut conn).await
                    })
                    .await?;
                Ok(ScriptOutcome::Applied(applied == 1))
            }
            Script::DeleteIfOwner { key, token } => {
                let applied: i64 = self
                    .bounded(name, async move {
                        scripts.delete_if_owner.key(key).arg(token).invoke_async(&mut conn).await
                    })
                    .await?;
                Ok(ScriptOutcome::Applied(applied == 1))
            }
            Script::AcquireSlot {
                key,
                member,
                capacity,
                now_ms,
                expires_at_ms,
            } => {
                let applied: i64 = self
                    .bounded(name, async move {
                        scripts
                            .acquire_slot
                            .key(key)
                            .arg(member)
                            .arg(capacity)
                            .arg(now_ms)
                            .arg(expires_at_ms)
                            .arg(MAX_TTL_MS)
                            .invoke_async(&mut conn)
                            .await
                    })
                    .await?;
                Ok(ScriptOutcome::Applied(applied == 1))
            }
            Script::ReleaseSlot { key, member } => {
                let mut cmd = redis::cmd("ZREM");
                cmd.arg(key).arg(member);
                let removed: u64 = self.bounded(name, async move { cmd.query_async(&mut conn).await }).await?;
                Ok(ScriptOutcome::Applied(removed > 0))
            }
            Script::CountSlots { key, now_ms } => {
                let mut cmd = redis::cmd("ZCOUNT");
                cmd.arg(key).arg(format!("({now_ms}")).arg("+inf");
                let count: u64 = self.bounded(name, async move { cmd.query_async(&mut conn).await }).await?;
                Ok(ScriptOutcome::Count(count))
            }
            Script::ConsumeToken {
                tokens_key,
                last_refill_key,
                burst,
                interval_ms,
                now_ms,
            } => {
                let (acquired, tokens): (i64, String) = self
                    .bounded(name, async move {
                        scripts
                            .consume_token
                            .key(tokens_key)
                            .key(last_refill_key)
                            .arg(burst)
                            .arg(interval_ms)
                            .arg(now_ms)
                            .invoke_async(&mut conn)
                            .await
                    })
                    .await?;
                let tokens = tokens.parse::<f64>().map_err(|e| StoreError::UnexpectedReply {
                    script: name,
                    reason: format!("token count '{tokens}' is not a number: {e}"),
                })?;
                Ok(ScriptOutcome::Bucket(BucketOutcome {
                    acquired: acquired == 1,
                    tokens,
                }))
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// ============================================================================
// Tests (require a running Redis; address from CORRAL_TEST_REDIS_URL)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verified;
    use crate::verified::BucketState;

    async fn create_test_store() -> RedisStore {
        let url = std::env::var("CORRAL_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisStore::connect(&url, Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis (set CORRAL_TEST_REDIS_URL)")
    }

    fn test_key(name: &str) -> String {
        format!("corral-test:{}:{name}", std::process::id())
    }

    async fn pttl(store: &RedisStore, key: &str) -> i64 {
        let mut conn = store.manager.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let ttl: i64 = cmd.query_async(&mut conn).await.unwrap();
        ttl
    }

    #[test]
    fn test_ttl_clamped_to_server_range() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(250)), 250);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL_MS);
        assert_eq!(clamp_ttl_ms(u64::MAX), MAX_TTL_MS);
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected() {
        let err = RedisStore::connect("not a redis url", Duration::from_millis(100)).await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidUrl { .. }));
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_set_if_not_exists_is_exclusive() {
        let store = create_test_store().await;
        let key = test_key("lock:a");
        store.delete(&key).await.unwrap();

        assert!(store.set_if_not_exists(&key, b"t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_not_exists(&key, b"t2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(b"t1".to_vec()));

        // An oversized TTL is clamped rather than rejected by the server.
        store.set_with_ttl(&key, b"t3", Duration::MAX).await.unwrap();
        assert!(pttl(&store, &key).await > 0);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_renew_and_delete_require_owner() {
        let store = create_test_store().await;
        let key = test_key("lock:b");
        store.delete(&key).await.unwrap();
        store.set_if_not_exists(&key, b"owner", Duration::from_secs(5)).await.unwrap();

        let renew = |token: &str| Script::RenewIfOwner {
            key: key.clone(),
            token: token.to_string(),
            ttl_ms: 60_000,
        };
        assert!(!store.eval(renew("intruder")).await.unwrap().into_applied("r").unwrap());
        assert!(pttl(&store, &key).await <= 5_000);
        assert!(store.eval(renew("owner")).await.unwrap().into_applied("r").unwrap());
        assert!(pttl(&store, &key).await > 5_000);

        let delete = |token: &str| Script::DeleteIfOwner {
            key: key.clone(),
            token: token.to_string(),
        };
        assert!(!store.eval(delete("intruder")).await.unwrap().into_applied("d").unwrap());
        assert!(store.exists(&key).await.unwrap());
        assert!(store.eval(delete("owner")).await.unwrap().into_applied("d").unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_slots_respect_capacity() {
        let store = create_test_store().await;
        let key = test_key("guard:browser:slots");
        store.delete(&key).await.unwrap();
        let acquire = |member: &str| Script::AcquireSlot {
            key: key.clone(),
            member: member.to_string(),
            capacity: 2,
            now_ms: 1_000,
            expires_at_ms: 61_000,
        };

        assert!(store.eval(acquire("a")).await.unwrap().into_applied("s").unwrap());
        assert!(store.eval(acquire("b")).await.unwrap().into_applied("s").unwrap());
        assert!(!store.eval(acquire("c")).await.unwrap().into_applied("s").unwrap());

        let count = Script::CountSlots {
            key: key.clone(),
            now_ms: 1_000,
        };
        assert_eq!(store.eval(count).await.unwrap().into_count("c").unwrap(), 2);

        let release = Script::ReleaseSlot {
            key: key.clone(),
            member: "a".to_string(),
        };
        assert!(store.eval(release.clone()).await.unwrap().into_applied("r").unwrap());
        assert!(!store.eval(release).await.unwrap().into_applied("r").unwrap());
        assert!(store.eval(acquire("c")).await.unwrap().into_applied("s").unwrap());

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_slot_expiring_now_is_pruned() {
        let store = create_test_store().await;
        let key = test_key("guard:prune:slots");
        store.delete(&key).await.unwrap();
        let acquire = |member: &str, now_ms: u64| Script::AcquireSlot {
            key: key.clone(),
            member: member.to_string(),
            capacity: 1,
            now_ms,
            expires_at_ms: now_ms + 60_000,
        };

        assert!(store.eval(acquire("a", 1_000)).await.unwrap().into_applied("s").unwrap());
        assert!(!store.eval(acquire("b", 60_999)).await.unwrap().into_applied("s").unwrap());
        // The prune is inclusive, matching verified::is_slot_expired.
        assert!(verified::is_slot_expired(61_000, 61_000));
        assert!(store.eval(acquire("b", 61_000)).await.unwrap().into_applied("s").unwrap());

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_short_slot_does_not_shorten_set_lifetime() {
        let store = create_test_store().await;
        let key = test_key("guard:ttl:slots");
        store.delete(&key).await.unwrap();
        let now_ms = 1_000;
        let slot = |member: &str, ttl_ms: u64| Script::AcquireSlot {
            key: key.clone(),
            member: member.to_string(),
            capacity: 5,
            now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };

        store.eval(slot("long", 60_000)).await.unwrap();
        assert!(pttl(&store, &key).await > 50_000);
        store.eval(slot("short", 10)).await.unwrap();
        assert!(pttl(&store, &key).await > 50_000);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_consume_token_matches_pure_bucket() {
        let store = create_test_store().await;
        let (tokens_key, last_refill_key) = (test_key("bucket:api:tokens"), test_key("bucket:api:last_refill"));
        store.delete(&tokens_key).await.unwrap();
        store.delete(&last_refill_key).await.unwrap();
        let consume = |now_ms| Script::ConsumeToken {
            tokens_key: tokens_key.clone(),
            last_refill_key: last_refill_key.clone(),
            burst: 2,
            interval_ms: 1_000,
            now_ms,
        };

        let mut state: Option<BucketState> = None;
        for now_ms in [5_000, 5_000, 5_000, 5_999, 6_000, 6_000] {
            let outcome = store.eval(consume(now_ms)).await.unwrap().into_bucket("b").unwrap();
            let expected = verified::consume_one(state, 2, 1_000, now_ms);
            assert_eq!(outcome.acquired, expected.acquired, "at {now_ms}");
            assert_eq!(outcome.tokens, expected.tokens, "at {now_ms}");
            if expected.acquired || state.is_none() {
                state = Some(BucketState {
                    tokens: expected.tokens,
                    last_refill_ms: expected.last_refill_ms,
                });
            }
        }

        store.delete(&tokens_key).await.unwrap();
        store.delete(&last_refill_key).await.unwrap();
    }
}
