//! Typed error taxonomies for configuration and codec failures
//! Everything else uses anyhow chains

use thiserror::Error;

/// Configuration errors are setup-fatal and always name the offending key
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config key '{0}'")]
    MissingKey(String),

    #[error("invalid value for config key '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-envelope codec errors, surfaced or dropped according to task config
#[derive(Debug, Error)]
pub enum SerdeError {
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
