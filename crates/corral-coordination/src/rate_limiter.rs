//! Token bucket rate limiting shared across processes.
//!
//! A limiter with `burst` B and `interval` I allows at most B calls at once
//! and then one more per I, summed over every process using the same id.
//! The bucket lives in two store keys and each refill-and-consume step runs
//! as one atomic script.
//!
//! The limit is soft: when the store is unreachable each process keeps its
//! own bucket with the same parameters, so the cluster-wide rate can exceed
//! the configured one by a factor of the process count.

use std::time::Duration;
use std::time::Instant;

use corral_store::Script;
use corral_store::SharedStore;
use corral_store::SharedStoreRef;
use corral_store::verified::BucketState;
use corral_store::verified::consume_one;
use tracing::debug;
use tracing::warn;

use crate::constants::DEFAULT_RATE_LIMIT_BURST;
use crate::constants::DEFAULT_RATE_LIMIT_INTERVAL_MS;
use crate::constants::DEFAULT_RATE_LIMIT_POLL_INTERVAL_MS;
use crate::constants::MAX_POLL_INTERVAL_MS;
use crate::constants::MAX_RATE_LIMIT_BURST;
use crate::constants::MAX_RATE_LIMIT_INTERVAL_MS;
use crate::constants::MIN_POLL_INTERVAL_MS;
use crate::error::CoordinationError;
use crate::error::at_most;
use crate::error::invalid;
use crate::metrics::FallbackMetrics;
use crate::metrics::FallbackSnapshot;
use crate::types::now_unix_ms;
use crate::verified;

/// Configuration for [`SoftRateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Time to refill one token.
    pub interval: Duration,
    /// Bucket capacity.
    pub burst: u32,
    /// Sleep between attempts in [`SoftRateLimiter::acquire`].
    pub poll_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RATE_LIMIT_INTERVAL_MS),
            burst: DEFAULT_RATE_LIMIT_BURST,
            poll_interval: Duration::from_millis(DEFAULT_RATE_LIMIT_POLL_INTERVAL_MS),
        }
    }
}

impl RateLimiterConfig {
    /// A limiter allowing `burst` calls at once and one more per `interval`.
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            ..Self::default()
        }
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.burst == 0 || self.burst > MAX_RATE_LIMIT_BURST {
            return Err(invalid("rate limiter", format!("burst must be in 1..={MAX_RATE_LIMIT_BURST}")));
        }
        if self.interval < Duration::from_millis(1) {
            return Err(invalid("rate limiter", "interval must be at least 1ms"));
        }
        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(invalid("rate limiter", "poll_interval must be at least 1ms"));
        }
        at_most("rate limiter", "interval", self.interval, MAX_RATE_LIMIT_INTERVAL_MS)?;
        at_most("rate limiter", "poll_interval", self.poll_interval, MAX_POLL_INTERVAL_MS)?;
        Ok(())
    }

    fn interval_ms(&self) -> u64 {
        u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)
    }
}

/// A token bucket identified by `id`, shared by every process that uses it.
pub struct SoftRateLimiter {
    id: String,
    config: RateLimiterConfig,
    shared: Option<SharedStoreRef>,
    local: parking_lot::Mutex<Option<BucketState>>,
    metrics: FallbackMetrics,
}

impl SoftRateLimiter {
    /// Create a limiter. With `store` set to `None` it limits this process only.
    pub fn new(
        id: impl Into<String>,
        store: Option<SharedStoreRef>,
        config: RateLimiterConfig,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        Ok(Self {
            id: id.into(),
            config,
            shared: store,
            local: parking_lot::Mutex::new(None),
            metrics: FallbackMetrics::default(),
        })
    }

    /// Bucket id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Operation counters.
    pub fn metrics(&self) -> FallbackSnapshot {
        self.metrics.snapshot()
    }

    /// Take one token if one is available right now.
    pub async fn try_consume(&self) -> bool {
        let Some(store) = &self.shared else {
            return self.consume_local();
        };
        let (tokens_key, last_refill_key) = verified::bucket_keys(&self.id);
        let script = Script::ConsumeToken {
            tokens_key,
            last_refill_key,
            burst: self.config.burst,
            interval_ms: self.config.interval_ms(),
            now_ms: now_unix_ms(),
        };
        let script_name = script.name();
        match store.eval(script).await.and_then(|o| o.into_bucket(script_name)) {
            Ok(outcome) => {
                self.metrics.record_shared();
                debug!(id = %self.id, acquired = outcome.acquired, tokens = outcome.tokens, "rate limiter step");
                outcome.acquired
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(id = %self.id, error = %e, "rate limiter store unavailable, using local bucket");
                self.consume_local()
            }
        }
    }

    fn consume_local(&self) -> bool {
        self.metrics.record_local();
        let mut state = self.local.lock();
        let decision = consume_one(*state, self.config.burst, self.config.interval_ms(), now_unix_ms());
        if decision.acquired || state.is_none() {
            *state = Some(BucketState {
                tokens: decision.tokens,
                last_refill_ms: decision.last_refill_ms,
            });
        }
        debug!(id = %self.id, acquired = decision.acquired, tokens = decision.tokens, "local rate limiter step");
        decision.acquired
    }

    /// Wait up to `timeout` for a token.
    ///
    /// Retries every poll interval and makes a final attempt at the deadline.
    /// Returns false on timeout; the caller decides whether to skip or defer.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = verified::deadline_after(Instant::now(), timeout);
        loop {
            if self.try_consume().await {
                return true;
            }
            match verified::next_poll_delay(Instant::now(), deadline, self.config.poll_interval) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    self.metrics.record_timeout();
                    debug!(id = %self.id, timeout_ms = timeout.as_millis() as u64, "rate limiter acquire timed out");
                    return false;
                }
            }
        }
    }
}
