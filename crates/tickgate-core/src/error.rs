use std::path::PathBuf;

use thiserror::Error;

/// Configuration and policy validation errors exposed by `tickgate-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pacing min_interval {min:?} exceeds max_interval {max:?}")]
    InvertedPacingBounds {
        min: std::time::Duration,
        max: std::time::Duration,
    },
    #[error("retry jitter range is inverted: [{low:?}, {high:?})")]
    InvertedJitterRange {
        low: std::time::Duration,
        high: std::time::Duration,
    },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnvValue { name: &'static str, value: String },

    #[error("failed to read config file '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
