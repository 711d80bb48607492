//! Process-level governance configuration.
//!
//! A [`GovernanceConfig`] is always applied as a whole: every setter on the
//! runtime components takes a complete replacement value, never a patch.
//!
//! Values load from JSON (durations as fractional seconds) and can then be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TICKGATE_MIN_INTERVAL` | `pacing.min_interval` |
//! | `TICKGATE_MAX_INTERVAL` | `pacing.max_interval` |
//! | `TICKGATE_RANDOMIZE` | `pacing.randomized` |
//! | `TICKGATE_MAX_RETRIES` | `retry.max_retries` |
//! | `TICKGATE_BASE_DELAY` | `retry.base_delay` |
//! | `TICKGATE_MAX_DELAY` | `retry.max_delay` |
//! | `TICKGATE_CACHE_TTL` | `cache.default_ttl` |

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{ConfigError, CoreError};
use crate::retry::RetryPolicy;
use crate::routing::RouterTable;
use crate::throttling::PacingConfig;

pub const ENV_MIN_INTERVAL: &str = "TICKGATE_MIN_INTERVAL";
pub const ENV_MAX_INTERVAL: &str = "TICKGATE_MAX_INTERVAL";
pub const ENV_RANDOMIZE: &str = "TICKGATE_RANDOMIZE";
pub const ENV_MAX_RETRIES: &str = "TICKGATE_MAX_RETRIES";
pub const ENV_BASE_DELAY: &str = "TICKGATE_BASE_DELAY";
pub const ENV_MAX_DELAY: &str = "TICKGATE_MAX_DELAY";
pub const ENV_CACHE_TTL: &str = "TICKGATE_CACHE_TTL";

/// Complete configuration for a [`crate::Governor`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub pacing: PacingConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub sources: RouterTable,
}

impl GovernanceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Applies `TICKGATE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| env::var(name).ok())
    }

    /// Applies overrides from an arbitrary lookup, e.g. a map in tests.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MIN_INTERVAL) {
            self.pacing.min_interval = parse_seconds(ENV_MIN_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_INTERVAL) {
            self.pacing.max_interval = parse_seconds(ENV_MAX_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_RANDOMIZE) {
            self.pacing.randomized = parse_bool(ENV_RANDOMIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        name: ENV_MAX_RETRIES,
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup(ENV_BASE_DELAY) {
            self.retry.base_delay = parse_seconds(ENV_BASE_DELAY, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_DELAY) {
            self.retry.max_delay = parse_seconds(ENV_MAX_DELAY, &value)?;
        }
        if let Some(value) = lookup(ENV_CACHE_TTL) {
            self.cache.default_ttl = parse_seconds(ENV_CACHE_TTL, &value)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pacing.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

fn parse_seconds(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .ok_or_else(|| ConfigError::InvalidEnvValue {
            name,
            value: value.to_owned(),
        })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvValue {
            name,
            value: value.to_owned(),
        }),
    }
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            de::Error::custom(format!(
                "duration must be finite and non-negative seconds, got {seconds}"
            ))
        })
    }
}

/// Serde adapter for a map of names to durations in fractional seconds.
pub(crate) mod duration_secs_map {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BTreeMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(
            value
                .iter()
                .map(|(name, duration)| (name, duration.as_secs_f64())),
        )
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, f64>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, seconds)| {
                Duration::try_from_secs_f64(seconds)
                    .map(|duration| (name, duration))
                    .map_err(|_| {
                        de::Error::custom(format!(
                            "duration must be finite and non-negative seconds, got {seconds}"
                        ))
                    })
            })
            .collect()
    }
}
