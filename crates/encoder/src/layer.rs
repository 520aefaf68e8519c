use attention::MultiHeadAttention;
use candle_core::{DType, Device, Tensor};
use layers::{
    mlp::{FeedForward, FeedForwardConfig, GatedLinearUnit, PositionwiseFeedForward},
    norm::{LayerNorm, NormConfig},
    residual::{Dropout, Residual},
    ExecutionContext,
};

use crate::config::{EncoderConfig, FfnType};
use crate::error::EncoderError;

/// Epsilon of both layer norms in the block.
pub const LAYER_NORM_EPS: f64 = 1e-12;

fn build_residual(config: &EncoderConfig, device: &Device, dtype: DType) -> Result<Residual, EncoderError> {
    let norm = LayerNorm::init(
        NormConfig::new(config.d_model).with_epsilon(LAYER_NORM_EPS),
        device,
        dtype,
    )?;
    Ok(Residual::new(Dropout::new(config.dropout)?, norm))
}

fn build_ffn(config: &EncoderConfig, device: &Device, dtype: DType) -> Result<FeedForward, EncoderError> {
    let ffn_config = FeedForwardConfig::new(config.d_model, config.ffn_hidden, config.dropout);
    Ok(match config.ffn_type {
        FfnType::Default => {
            FeedForward::Positionwise(PositionwiseFeedForward::new(ffn_config, device, dtype)?)
        }
        FfnType::Glu => FeedForward::Gated(GatedLinearUnit::new(ffn_config, device, dtype)?),
    })
}

/// Post-norm transformer encoder block.
///
/// ```text
/// x = norm1(x + dropout(attention(x, x, x, mask)))
/// x = norm2(x + dropout(ffn(x)))
/// ```
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    config: EncoderConfig,
    attention: MultiHeadAttention,
    attention_residual: Residual,
    ffn: FeedForward,
    ffn_residual: Residual,
}

impl EncoderLayer {
    /// Validates `config` and initialises every sublayer on `device`.
    pub fn new(config: &EncoderConfig, device: &Device, dtype: DType) -> Result<Self, EncoderError> {
        config.validate()?;
        let attention = MultiHeadAttention::new(
            config.d_model,
            config.n_head,
            &config.attention,
            device,
            dtype,
        )?;
        log::info!(
            "encoder::layer init d_model={} n_head={} ffn_hidden={} ffn_type={} attention={:?} dropout={}",
            config.d_model,
            config.n_head,
            config.ffn_hidden,
            config.ffn_type,
            config.attention,
            config.dropout
        );
        Ok(Self {
            config: config.clone(),
            attention,
            attention_residual: build_residual(config, device, dtype)?,
            ffn: build_ffn(config, device, dtype)?,
            ffn_residual: build_residual(config, device, dtype)?,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    pub fn ffn(&self) -> &FeedForward {
        &self.ffn
    }

    /// Runs the block over `x` shaped `[batch, length, D_MODEL]`.
    ///
    /// `src_mask` is a key-padding mask in any layout accepted by
    /// [`attention::masks::expand_key_mask`].
    pub fn forward(
        &self,
        x: &Tensor,
        src_mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, EncoderError> {
        let length = match x.dims() {
            [_, length, hidden] if *hidden == self.config.d_model => *length,
            dims => {
                return Err(EncoderError::shape(format!(
                    "encoder input expected [batch, length, {}] got {dims:?}",
                    self.config.d_model
                )))
            }
        };
        if length > self.config.max_seq_length {
            return Err(EncoderError::shape(format!(
                "sequence length {length} exceeds MAX_SEQ_LENGTH {}",
                self.config.max_seq_length
            )));
        }

        let attended = self.attention.forward(x, x, x, src_mask, ctx)?;
        let x = self.attention_residual.postnorm_step(&attended, x, ctx)?;

        let transformed = self.ffn.forward(&x, ctx)?;
        Ok(self.ffn_residual.postnorm_step(&transformed, &x, ctx)?)
    }
}
