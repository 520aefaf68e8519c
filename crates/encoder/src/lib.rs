//! One transformer encoder block with a selectable attention strategy.
//!
//! [`EncoderLayer`] wires [`attention::MultiHeadAttention`] and a feed-forward
//! sublayer from [`layers`] into the post-norm residual layout. Layers are
//! built from an [`EncoderConfig`], which can be loaded from TOML or JSON.

pub mod config;
pub mod error;
pub mod layer;

pub use config::{EncoderConfig, FfnType};
pub use error::{ConfigError, EncoderError};
pub use layer::{EncoderLayer, LAYER_NORM_EPS};
