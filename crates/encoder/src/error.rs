//! Errors raised while configuring or running an encoder layer.

use attention::AttentionError;
use thiserror::Error;

/// Failures while loading or validating an [`EncoderConfig`](crate::EncoderConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Format(String),
    #[error("invalid encoder configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

/// Failures surfaced by [`EncoderLayer`](crate::EncoderLayer).
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error("invalid tensor shape: {context}")]
    Shape { context: String },
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl EncoderError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
        }
    }
}
