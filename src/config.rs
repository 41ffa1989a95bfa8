use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use corral_coordination::CacheConfig;
use corral_coordination::LeaderConfig;
use corral_coordination::RateLimiterConfig;
use corral_coordination::SemaphoreConfig;
use corral_coordination::constants;
use corral_store::StoreError;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

/// Configuration for every coordination primitive.
///
/// Configuration is loaded in layers with the following precedence (lowest to highest):
/// 1. Built-in defaults
/// 2. Environment variables (CORRAL_*)
/// 3. TOML configuration file
///
/// Without a `store_url` every primitive runs in local-only mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorralConfig {
    /// Redis URL of the shared store, e.g. `redis://127.0.0.1:6379`.
    pub store_url: Option<String>,

    /// Upper bound on any single store call in milliseconds.
    #[serde(default = "default_store_op_timeout_ms")]
    pub store_op_timeout_ms: u64,

    /// Named semaphore guards.
    #[serde(default)]
    pub semaphore: SemaphoreSection,

    /// Default rate limiter parameters.
    #[serde(default)]
    pub rate_limiter: RateLimiterSection,

    /// Stampede cache parameters.
    #[serde(default)]
    pub cache: CacheSection,

    /// Leader lock parameters.
    #[serde(default)]
    pub leader: LeaderSection,
}

/// `[semaphore]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreSection {
    #[serde(default = "default_semaphore_capacity")]
    pub default_capacity: u32,
    /// Capacity per guard name.
    #[serde(default)]
    pub capacities: HashMap<String, u32>,
    #[serde(default = "default_slot_ttl_ms")]
    pub slot_ttl_ms: u64,
    #[serde(default = "default_semaphore_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_semaphore_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// `[rate_limiter]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSection {
    #[serde(default = "default_rate_limit_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
    #[serde(default = "default_rate_limit_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// `[cache]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Entry lifetime per dataset (cache namespace) in milliseconds.
    #[serde(default)]
    pub dataset_ttls: HashMap<String, u64>,
    #[serde(default = "default_cache_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_cache_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_cache_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// `[leader]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderSection {
    #[serde(default = "default_leader_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_leader_renewal_divisor")]
    pub renewal_divisor: u32,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            store_op_timeout_ms: default_store_op_timeout_ms(),
            semaphore: SemaphoreSection::default(),
            rate_limiter: RateLimiterSection::default(),
            cache: CacheSection::default(),
            leader: LeaderSection::default(),
        }
    }
}

impl Default for SemaphoreSection {
    fn default() -> Self {
        Self {
            default_capacity: default_semaphore_capacity(),
            capacities: HashMap::new(),
            slot_ttl_ms: default_slot_ttl_ms(),
            wait_timeout_ms: default_semaphore_wait_timeout_ms(),
            poll_interval_ms: default_semaphore_poll_interval_ms(),
        }
    }
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        Self {
            interval_ms: default_rate_limit_interval_ms(),
            burst: default_rate_limit_burst(),
            poll_interval_ms: default_rate_limit_poll_interval_ms(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_cache_ttl_ms(),
            dataset_ttls: HashMap::new(),
            lock_ttl_ms: default_cache_lock_ttl_ms(),
            wait_timeout_ms: default_cache_wait_timeout_ms(),
            poll_interval_ms: default_cache_poll_interval_ms(),
        }
    }
}

impl Default for LeaderSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_leader_ttl_ms(),
            renewal_divisor: default_leader_renewal_divisor(),
        }
    }
}

impl CorralConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern CORRAL_<SECTION>_<FIELD> (uppercase).
    /// Map-valued fields take `name=value` pairs separated by commas, e.g.
    /// `CORRAL_SEMAPHORE_CAPACITIES=browser=2,export=4`.
    pub fn from_env() -> Self {
        Self {
            store_url: parse_env("CORRAL_STORE_URL"),
            store_op_timeout_ms: parse_env("CORRAL_STORE_OP_TIMEOUT_MS").unwrap_or_else(default_store_op_timeout_ms),
            semaphore: SemaphoreSection {
                default_capacity: parse_env("CORRAL_SEMAPHORE_DEFAULT_CAPACITY")
                    .unwrap_or_else(default_semaphore_capacity),
                capacities: parse_env_map("CORRAL_SEMAPHORE_CAPACITIES"),
                slot_ttl_ms: parse_env("CORRAL_SEMAPHORE_SLOT_TTL_MS").unwrap_or_else(default_slot_ttl_ms),
                wait_timeout_ms: parse_env("CORRAL_SEMAPHORE_WAIT_TIMEOUT_MS")
                    .unwrap_or_else(default_semaphore_wait_timeout_ms),
                poll_interval_ms: parse_env("CORRAL_SEMAPHORE_POLL_INTERVAL_MS")
                    .unwrap_or_else(default_semaphore_poll_interval_ms),
            },
            rate_limiter: RateLimiterSection {
                interval_ms: parse_env("CORRAL_RATE_LIMITER_INTERVAL_MS").unwrap_or_else(default_rate_limit_interval_ms),
                burst: parse_env("CORRAL_RATE_LIMITER_BURST").unwrap_or_else(default_rate_limit_burst),
                poll_interval_ms: parse_env("CORRAL_RATE_LIMITER_POLL_INTERVAL_MS")
                    .unwrap_or_else(default_rate_limit_poll_interval_ms),
            },
            cache: CacheSection {
                default_ttl_ms: parse_env("CORRAL_CACHE_DEFAULT_TTL_MS").unwrap_or_else(default_cache_ttl_ms),
                dataset_ttls: parse_env_map("CORRAL_CACHE_DATASET_TTLS"),
                lock_ttl_ms: parse_env("CORRAL_CACHE_LOCK_TTL_MS").unwrap_or_else(default_cache_lock_ttl_ms),
                wait_timeout_ms: parse_env("CORRAL_CACHE_WAIT_TIMEOUT_MS").unwrap_or_else(default_cache_wait_timeout_ms),
                poll_interval_ms: parse_env("CORRAL_CACHE_POLL_INTERVAL_MS")
                    .unwrap_or_else(default_cache_poll_interval_ms),
            },
            leader: LeaderSection {
                ttl_ms: parse_env("CORRAL_LEADER_TTL_MS").unwrap_or_else(default_leader_ttl_ms),
                renewal_divisor: parse_env("CORRAL_LEADER_RENEWAL_DIVISOR")
                    .unwrap_or_else(default_leader_renewal_divisor),
            },
        }
    }

    /// Environment variables overlaid with the TOML file at `path`, if any,
    /// then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            config.merge(Self::from_toml_file(path)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Merge configuration from another source.
    ///
    /// Fields in `other` that are `Some`, non-empty or non-default override
    /// fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.store_url.is_some() {
            self.store_url = other.store_url;
        }
        if other.store_op_timeout_ms != default_store_op_timeout_ms() {
            self.store_op_timeout_ms = other.store_op_timeout_ms;
        }

        let semaphore = other.semaphore;
        if semaphore.default_capacity != default_semaphore_capacity() {
            self.semaphore.default_capacity = semaphore.default_capacity;
        }
        self.semaphore.capacities.extend(semaphore.capacities);
        if semaphore.slot_ttl_ms != default_slot_ttl_ms() {
            self.semaphore.slot_ttl_ms = semaphore.slot_ttl_ms;
        }
        if semaphore.wait_timeout_ms != default_semaphore_wait_timeout_ms() {
            self.semaphore.wait_timeout_ms = semaphore.wait_timeout_ms;
        }
        if semaphore.poll_interval_ms != default_semaphore_poll_interval_ms() {
            self.semaphore.poll_interval_ms = semaphore.poll_interval_ms;
        }

        let rate_limiter = other.rate_limiter;
        if rate_limiter.interval_ms != default_rate_limit_interval_ms() {
            self.rate_limiter.interval_ms = rate_limiter.interval_ms;
        }
        if rate_limiter.burst != default_rate_limit_burst() {
            self.rate_limiter.burst = rate_limiter.burst;
        }
        if rate_limiter.poll_interval_ms != default_rate_limit_poll_interval_ms() {
            self.rate_limiter.poll_interval_ms = rate_limiter.poll_interval_ms;
        }

        let cache = other.cache;
        if cache.default_ttl_ms != default_cache_ttl_ms() {
            self.cache.default_ttl_ms = cache.default_ttl_ms;
        }
        self.cache.dataset_ttls.extend(cache.dataset_ttls);
        if cache.lock_ttl_ms != default_cache_lock_ttl_ms() {
            self.cache.lock_ttl_ms = cache.lock_ttl_ms;
        }
        if cache.wait_timeout_ms != default_cache_wait_timeout_ms() {
            self.cache.wait_timeout_ms = cache.wait_timeout_ms;
        }
        if cache.poll_interval_ms != default_cache_poll_interval_ms() {
            self.cache.poll_interval_ms = cache.poll_interval_ms;
        }

        if other.leader.ttl_ms != default_leader_ttl_ms() {
            self.leader.ttl_ms = other.leader.ttl_ms;
        }
        if other.leader.renewal_divisor != default_leader_renewal_divisor() {
            self.leader.renewal_divisor = other.leader.renewal_divisor;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.store_url
            && url.trim().is_empty()
        {
            return Err(ConfigError::Validation {
                message: "store_url must not be empty when set".into(),
            });
        }
        if self.store_op_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "store_op_timeout_ms must be non-zero".into(),
            });
        }
        let checks = [
            self.semaphore_config().validate(),
            self.rate_limiter_config().validate(),
            self.cache_config().validate(),
            self.leader_config().validate(),
        ];
        for check in checks {
            check.map_err(|e| ConfigError::Validation { message: e.to_string() })?;
        }
        Ok(())
    }

    /// Bound on a single store call.
    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout_ms)
    }

    /// Semaphore settings as the primitive expects them.
    pub fn semaphore_config(&self) -> SemaphoreConfig {
        SemaphoreConfig {
            default_capacity: self.semaphore.default_capacity,
            capacities: self.semaphore.capacities.clone(),
            slot_ttl: Duration::from_millis(self.semaphore.slot_ttl_ms),
            wait_timeout: Duration::from_millis(self.semaphore.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.semaphore.poll_interval_ms),
        }
    }

    /// Default rate limiter settings.
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            interval: Duration::from_millis(self.rate_limiter.interval_ms),
            burst: self.rate_limiter.burst,
            poll_interval: Duration::from_millis(self.rate_limiter.poll_interval_ms),
        }
    }

    /// Cache settings.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_millis(self.cache.default_ttl_ms),
            dataset_ttls: self
                .cache
                .dataset_ttls
                .iter()
                .map(|(dataset, ttl_ms)| (dataset.clone(), Duration::from_millis(*ttl_ms)))
                .collect(),
            lock_ttl: Duration::from_millis(self.cache.lock_ttl_ms),
            wait_timeout: Duration::from_millis(self.cache.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.cache.poll_interval_ms),
        }
    }

    /// Leader lock settings.
    pub fn leader_config(&self) -> LeaderConfig {
        LeaderConfig {
            ttl: Duration::from_millis(self.leader.ttl_ms),
            renewal_divisor: self.leader.renewal_divisor,
        }
    }
}

// Default value functions
fn default_store_op_timeout_ms() -> u64 {
    500
}

fn default_semaphore_capacity() -> u32 {
    constants::DEFAULT_SEMAPHORE_CAPACITY
}

fn default_slot_ttl_ms() -> u64 {
    constants::DEFAULT_SLOT_TTL_MS
}

fn default_semaphore_wait_timeout_ms() -> u64 {
    constants::DEFAULT_ACQUIRE_WAIT_TIMEOUT_MS
}

fn default_semaphore_poll_interval_ms() -> u64 {
    constants::DEFAULT_SEMAPHORE_POLL_INTERVAL_MS
}

fn default_rate_limit_interval_ms() -> u64 {
    constants::DEFAULT_RATE_LIMIT_INTERVAL_MS
}

fn default_rate_limit_burst() -> u32 {
    constants::DEFAULT_RATE_LIMIT_BURST
}

fn default_rate_limit_poll_interval_ms() -> u64 {
    constants::DEFAULT_RATE_LIMIT_POLL_INTERVAL_MS
}

fn default_cache_ttl_ms() -> u64 {
    constants::DEFAULT_CACHE_TTL_MS
}

fn default_cache_lock_ttl_ms() -> u64 {
    constants::DEFAULT_CACHE_LOCK_TTL_MS
}

fn default_cache_wait_timeout_ms() -> u64 {
    constants::DEFAULT_CACHE_WAIT_TIMEOUT_MS
}

fn default_cache_poll_interval_ms() -> u64 {
    constants::DEFAULT_CACHE_POLL_INTERVAL_MS
}

fn default_leader_ttl_ms() -> u64 {
    constants::DEFAULT_LEADER_TTL_MS
}

fn default_leader_renewal_divisor() -> u32 {
    constants::DEFAULT_LEADER_RENEWAL_DIVISOR
}

// Helper functions for parsing environment variables
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn parse_env_map<T: std::str::FromStr>(key: &str) -> HashMap<String, T> {
    std::env::var(key).ok().map(|s| parse_pairs(&s)).unwrap_or_default()
}

/// Parse `a=1,b=2`. Malformed pairs are skipped.
fn parse_pairs<T: std::str::FromStr>(input: &str) -> HashMap<String, T> {
    input
        .split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

/// Configuration loading and connection errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },

    #[snafu(display("failed to connect to shared store at {url}: {source}"))]
    Connect { url: String, source: StoreError },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = CorralConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_url, None);
        assert_eq!(config.store_op_timeout(), Duration::from_millis(500));
        assert_eq!(config.semaphore.default_capacity, 2);
        assert_eq!(config.semaphore.slot_ttl_ms, 300_000);
        assert_eq!(config.rate_limiter.burst, 1);
        assert_eq!(config.cache.default_ttl_ms, 3_600_000);
        assert_eq!(config.leader_config().renewal_interval(), Duration::from_secs(12));
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut config = CorralConfig::default();
        config.semaphore.capacities.insert("browser".into(), 0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert!(err.to_string().contains("browser"));
    }

    #[test]
    fn test_validation_divisor() {
        let mut config = CorralConfig::default();
        config.leader.renewal_divisor = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_empty_url() {
        let config = CorralConfig {
            store_url: Some("  ".into()),
            ..CorralConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_pairs() {
        let parsed: HashMap<String, u32> = parse_pairs("browser=2, export = 4,broken,=3,bad=x");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["browser"], 2);
        assert_eq!(parsed["export"], 4);
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
store_url = "redis://127.0.0.1:6379"

[semaphore]
capacities = {{ browser = 3 }}

[cache]
dataset_ttls = {{ prices = 60000 }}

[leader]
ttl_ms = 10000
"#
        )
        .unwrap();

        let config = CorralConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.store_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.semaphore_config().capacity_for("browser"), 3);
        assert_eq!(config.semaphore_config().capacity_for("other"), 2);
        assert_eq!(config.cache_config().ttl_for("prices"), Duration::from_secs(60));
        assert_eq!(config.leader.ttl_ms, 10_000);
        assert_eq!(config.leader.renewal_divisor, 5);
    }

    #[test]
    fn test_missing_file() {
        let err = CorralConfig::from_toml_file(Path::new("/nonexistent/corral.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_merge() {
        let mut base = CorralConfig::default();
        base.semaphore.capacities.insert("browser".into(), 2);

        let mut overlay = CorralConfig {
            store_url: Some("redis://cache:6379".into()),
            ..CorralConfig::default()
        };
        overlay.semaphore.capacities.insert("export".into(), 4);
        overlay.rate_limiter.burst = 10;

        base.merge(overlay);
        assert_eq!(base.store_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(base.semaphore.capacities.len(), 2);
        assert_eq!(base.rate_limiter.burst, 10);
        assert_eq!(base.rate_limiter.interval_ms, 1_000);
    }
}
