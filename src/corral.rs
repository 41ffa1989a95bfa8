//! Process-wide entry point handing out coordination primitives.

use std::sync::Arc;

use corral_coordination::CoordinationError;
use corral_coordination::DistributedMutex;
use corral_coordination::DistributedSemaphore;
use corral_coordination::LeaderLock;
use corral_coordination::RateLimiterConfig;
use corral_coordination::SoftRateLimiter;
use corral_coordination::StampedeCache;
use corral_store::RedisStore;
use corral_store::SharedStoreRef;
use corral_store::StoreError;
use snafu::ResultExt;
use tracing::info;
use tracing::warn;

use crate::config::ConfigError;
use crate::config::ConnectSnafu;
use crate::config::CorralConfig;

/// Shared store connection plus the primitives built on it.
///
/// The mutex and semaphore are shared by everything obtained from one
/// `Corral`, so leader locks and guards created here see each other's
/// local fallback state.
pub struct Corral {
    config: CorralConfig,
    store: Option<SharedStoreRef>,
    mutex: Arc<DistributedMutex>,
    semaphore: Arc<DistributedSemaphore>,
}

impl Corral {
    /// Connect to the configured store.
    ///
    /// A store that cannot be reached at startup is not fatal: the failure
    /// is logged and every primitive runs in local-only mode. An invalid
    /// configuration, including a malformed `store_url`, is an error, as is
    /// a store that answers but refuses the connection.
    pub async fn connect(config: CorralConfig) -> Result<Self, ConfigError> {
        match Self::try_connect(config.clone()).await {
            Ok(corral) => Ok(corral),
            Err(ConfigError::Connect { url, source }) if source.is_unavailable() => {
                warn!(url = %url, error = %source, "shared store unreachable, running in local-only mode");
                Self::local(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Connect to the configured store, failing if it cannot be reached.
    pub async fn try_connect(config: CorralConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let Some(url) = config.store_url.clone() else {
            return Self::local(config);
        };
        let store = match RedisStore::connect(&url, config.store_op_timeout()).await {
            Ok(store) => store,
            Err(e @ StoreError::InvalidUrl { .. }) => {
                return Err(ConfigError::Validation { message: e.to_string() });
            }
            Err(e) => return Err(e).context(ConnectSnafu { url: url.clone() }),
        };
        info!(url = %url, "connected to shared store");
        Self::with_store(config, Some(Arc::new(store)))
    }

    /// Build a facade whose primitives only coordinate within this process.
    pub fn local(config: CorralConfig) -> Result<Self, ConfigError> {
        Self::with_store(config, None)
    }

    /// Build a facade over an existing store handle.
    pub fn with_store(config: CorralConfig, store: Option<SharedStoreRef>) -> Result<Self, ConfigError> {
        config.validate()?;
        let semaphore = DistributedSemaphore::new(store.clone(), config.semaphore_config()).map_err(validation)?;
        Ok(Self {
            mutex: Arc::new(DistributedMutex::with_store(store.clone())),
            semaphore: Arc::new(semaphore),
            store,
            config,
        })
    }

    /// Whether a shared store is in use.
    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    /// The shared store, if any.
    pub fn store(&self) -> Option<&SharedStoreRef> {
        self.store.as_ref()
    }

    /// The configuration this facade was built from.
    pub fn config(&self) -> &CorralConfig {
        &self.config
    }

    /// The process-wide mutex.
    pub fn mutex(&self) -> Arc<DistributedMutex> {
        Arc::clone(&self.mutex)
    }

    /// The process-wide set of named semaphore guards.
    pub fn semaphore(&self) -> Arc<DistributedSemaphore> {
        Arc::clone(&self.semaphore)
    }

    /// A rate limiter for bucket `id` with the configured defaults.
    pub fn rate_limiter(&self, id: &str) -> Result<SoftRateLimiter, CoordinationError> {
        self.rate_limiter_with(id, self.config.rate_limiter_config())
    }

    /// A rate limiter for bucket `id` with its own interval and burst.
    ///
    /// Every process using the same `id` must use the same parameters.
    pub fn rate_limiter_with(&self, id: &str, config: RateLimiterConfig) -> Result<SoftRateLimiter, CoordinationError> {
        SoftRateLimiter::new(id, self.store.clone(), config)
    }

    /// A stampede cache for `namespace`, with the namespace's dataset TTL.
    pub fn cache(&self, namespace: &str) -> Result<StampedeCache, CoordinationError> {
        StampedeCache::new(namespace, self.store.clone(), self.config.cache_config())
    }

    /// A leader lock for role `name`.
    pub fn leader_lock(&self, name: &str) -> Result<LeaderLock, CoordinationError> {
        LeaderLock::new(name, self.mutex(), self.config.leader_config())
    }
}

fn validation(e: CoordinationError) -> ConfigError {
    ConfigError::Validation { message: e.to_string() }
}
