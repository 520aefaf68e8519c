//! Hyper-parameters of one encoder layer and their on-disk formats.
//!
//! Keys use the upper-case names of the training configuration files:
//!
//! ```toml
//! D_MODEL = 300
//! N_HEAD = 6
//! FFN_HIDDEN = 1200
//! DROPOUT = 0.1
//! MAX_SEQ_LENGTH = 150
//! FFN_TYPE = "glu"                              # optional, "default" otherwise
//! ATTENTION = { type = "robust", block_size = 15 } # optional, additive otherwise
//! ```

use std::{fmt, fs, path::Path};

use attention::AttentionKind;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Feed-forward sublayer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FfnType {
    /// Two dense layers with a ReLU in between.
    #[default]
    Default,
    /// Gated linear unit.
    Glu,
}

impl From<String> for FfnType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "glu" => FfnType::Glu,
            "default" => FfnType::Default,
            other => {
                log::warn!("unrecognised FFN_TYPE '{other}', falling back to 'default'");
                FfnType::Default
            }
        }
    }
}

impl From<FfnType> for String {
    fn from(value: FfnType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FfnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfnType::Default => f.write_str("default"),
            FfnType::Glu => f.write_str("glu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EncoderConfig {
    pub d_model: usize,
    pub n_head: usize,
    pub ffn_hidden: usize,
    pub dropout: f32,
    pub max_seq_length: usize,
    #[serde(default)]
    pub ffn_type: FfnType,
    #[serde(default)]
    pub attention: AttentionKind,
}

impl EncoderConfig {
    /// Additive attention with the default feed-forward sublayer.
    pub fn new(
        d_model: usize,
        n_head: usize,
        ffn_hidden: usize,
        dropout: f32,
        max_seq_length: usize,
    ) -> Self {
        Self {
            d_model,
            n_head,
            ffn_hidden,
            dropout,
            max_seq_length,
            ffn_type: FfnType::Default,
            attention: AttentionKind::Additive,
        }
    }

    pub fn with_ffn_type(mut self, ffn_type: FfnType) -> Self {
        self.ffn_type = ffn_type;
        self
    }

    pub fn with_attention(mut self, attention: AttentionKind) -> Self {
        self.attention = attention;
        self
    }

    /// Width of one attention head.
    pub fn d_tensor(&self) -> usize {
        self.d_model / self.n_head.max(1)
    }

    /// Loads a TOML (`.toml`, no extension) or JSON (`.json`) file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: EncoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reports every violated constraint at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.d_model == 0 {
            errors.push("D_MODEL must be greater than 0".to_string());
        }
        if self.n_head == 0 {
            errors.push("N_HEAD must be greater than 0".to_string());
        } else if self.d_model % self.n_head != 0 {
            errors.push(format!(
                "D_MODEL ({}) must be divisible by N_HEAD ({})",
                self.d_model, self.n_head
            ));
        }
        if self.ffn_hidden == 0 {
            errors.push("FFN_HIDDEN must be greater than 0".to_string());
        }
        if self.max_seq_length == 0 {
            errors.push("MAX_SEQ_LENGTH must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("DROPOUT must be in [0, 1), got {}", self.dropout));
        }
        if let AttentionKind::Robust { block_size: 0, .. } = self.attention {
            errors.push("ATTENTION.block_size must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }
        Ok(())
    }
}
