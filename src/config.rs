//! Configuration management for Loginguard.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `LOGINGUARD__` (for example
//! `LOGINGUARD__TOKENS__SECRET` or `LOGINGUARD__STORE__BACKEND=redis`).

use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::auth::{GuardConfig, HashingConfig, TokenConfig};
use crate::error::{LoginGuardError, Result};
use crate::ratelimit::LimiterConfig;

const ENV_PREFIX: &str = "LOGINGUARD";

/// Main configuration for the Loginguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginGuardConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter parameters
    #[serde(default)]
    pub limiters: LimitersConfig,

    /// Credential hashing cost
    #[serde(default)]
    pub hashing: HashingConfig,

    /// Session token issuance
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Guard policy
    #[serde(default)]
    pub guard: GuardConfig,
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Shared Redis counters
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on each store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend drops expired counters, in seconds.
    /// Zero disables the sweep.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_purge_interval_secs() -> u64 {
    60
}

/// Parameters for the two login limiters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitersConfig {
    /// Failed attempts per source address
    #[serde(
        default = "default_by_address",
        deserialize_with = "by_address_over_defaults"
    )]
    pub by_address: LimiterConfig,

    /// Consecutive failures per identity and source address
    #[serde(
        default = "default_by_identity_and_address",
        deserialize_with = "by_identity_and_address_over_defaults"
    )]
    pub by_identity_and_address: LimiterConfig,
}

impl Default for LimitersConfig {
    fn default() -> Self {
        Self {
            by_address: default_by_address(),
            by_identity_and_address: default_by_identity_and_address(),
        }
    }
}

fn default_by_address() -> LimiterConfig {
    LimiterConfig::new(100, 86_400, 86_400, "login_fail_ip_per_day")
}

fn default_by_identity_and_address() -> LimiterConfig {
    LimiterConfig::new(5, 86_400, 3_600, "login_fail_consecutive_identity_and_ip")
}

/// A limiter section where every field is optional. Fields left out keep the
/// limiter's default, so a deployment can tune `points` alone.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimiterOverrides {
    points: Option<u64>,
    duration_secs: Option<u64>,
    block_duration_secs: Option<u64>,
    key_prefix: Option<String>,
}

impl LimiterOverrides {
    fn apply(self, mut base: LimiterConfig) -> LimiterConfig {
        if let Some(points) = self.points {
            base.points = points;
        }
        if let Some(duration_secs) = self.duration_secs {
            base.duration_secs = duration_secs;
        }
        if let Some(block_duration_secs) = self.block_duration_secs {
            base.block_duration_secs = block_duration_secs;
        }
        if let Some(key_prefix) = self.key_prefix {
            base.key_prefix = key_prefix;
        }
        base
    }
}

fn by_address_over_defaults<'de, D>(deserializer: D) -> std::result::Result<LimiterConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LimiterOverrides::deserialize(deserializer)?.apply(default_by_address()))
}

fn by_identity_and_address_over_defaults<'de, D>(
    deserializer: D,
) -> std::result::Result<LimiterConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LimiterOverrides::deserialize(deserializer)?.apply(default_by_identity_and_address()))
}

impl LoginGuardConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// The result is not validated; call [`LoginGuardConfig::validate`] before
    /// building a guard from it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LoginGuardError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LoginGuardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Check every startup rule. Any failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(LoginGuardError::Config(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(LoginGuardError::Config(
                "store.redis_url must be set for the redis backend".to_string(),
            ));
        }
        self.limiters.by_address.validate()?;
        self.limiters.by_identity_and_address.validate()?;
        if self.limiters.by_address.key_prefix == self.limiters.by_identity_and_address.key_prefix {
            return Err(LoginGuardError::Config(
                "limiters must use distinct key prefixes".to_string(),
            ));
        }
        self.hashing.params()?;
        self.tokens.validate()?;
        self.guard.validate()?;
        Ok(())
    }
}
