//! Position-aligned additive self-attention.
//!
//! Unlike pairwise attention, queries and keys are combined elementwise at
//! the same position and scored to a single scalar per position:
//!
//! ```text
//! score[b, h, l] = va · tanh((q[b, h, l, :] + k[b, h, l, :]) / 2)
//! alpha          = softmax over l of score      (masked positions -> -10000)
//! out[b, h, l,:] = alpha[b, h, l] * v[b, h, l, :]
//! ```
//!
//! No `length x length` matrix is ever formed, so cost is linear in length.

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{
    activations::ActivationKind,
    linear::{Linear, LinearConfig, LinearInit},
    ExecutionContext,
};

use crate::core::{check_operands, AttentionError, AttentionStrategy};
use crate::masks::expand_key_mask;

/// Pre-softmax score assigned to masked positions.
pub const MASK_SENTINEL: f32 = -10_000.0;

/// Additive scoring with a learned `d_tensor -> 1` projection.
#[derive(Debug, Clone)]
pub struct AdditiveAttention {
    d_tensor: usize,
    va: Linear,
}

impl AdditiveAttention {
    /// Creates the strategy with a freshly initialised score projection.
    pub fn new(d_tensor: usize, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        let va = Linear::with_init(
            LinearConfig::new(d_tensor, 1),
            &LinearInit::torch_default(),
            device,
            dtype,
        )?;
        Self::from_projection(va)
    }

    /// Wraps an existing score projection, which must map to a single output.
    pub fn from_projection(va: Linear) -> Result<Self, AttentionError> {
        let config = va.config();
        if config.output_dim != 1 {
            return Err(AttentionError::shape(format!(
                "additive score projection must map {} -> 1, got {} -> {}",
                config.input_dim, config.input_dim, config.output_dim
            )));
        }
        let d_tensor = config.input_dim;
        log::info!("attention::additive init d_tensor={d_tensor}");
        Ok(Self { d_tensor, va })
    }

    pub fn d_tensor(&self) -> usize {
        self.d_tensor
    }

    /// Normalised per-position weights `alpha`, shaped `[batch, head, length]`.
    ///
    /// Weights are returned in the reduction dtype of the context policy.
    pub fn weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError> {
        let dims = check_operands(&[("q", q), ("k", k)], ctx)?;
        if dims.d_tensor != self.d_tensor {
            return Err(AttentionError::shape(format!(
                "expected d_tensor {} but received {}",
                self.d_tensor, dims.d_tensor
            )));
        }

        let policy = ctx.policy();
        let combined = policy
            .cast_for_matmul(q)?
            .add(&policy.cast_for_matmul(k)?)?
            .affine(0.5, 0.0)?;
        let energy = ActivationKind::Tanh.forward(&combined, policy)?;

        let rows = dims.batch * dims.heads * dims.length;
        let score = self
            .va
            .forward(&energy.reshape((rows, dims.d_tensor))?, policy)?
            .reshape((dims.batch, dims.heads, dims.length))?;
        let mut score = policy.cast_for_reduction(&score)?;

        if let Some(mask) = mask {
            let keep = expand_key_mask(mask, ctx.device(), dims.batch, dims.heads, dims.length)?;
            let sentinel = Tensor::full(MASK_SENTINEL, score.dims(), score.device())?
                .to_dtype(score.dtype())?;
            score = keep.where_cond(&score, &sentinel)?;
        }

        Ok(softmax_last_dim(&score.contiguous()?)?)
    }
}

impl AttentionStrategy for AdditiveAttention {
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError> {
        check_operands(&[("q", q), ("k", k), ("v", v)], ctx)?;
        let alpha = self.weights(q, k, mask, ctx)?;
        let values = ctx.policy().cast_for_reduction(v)?;
        let output = alpha.unsqueeze(3)?.broadcast_mul(&values)?;
        Ok(output.to_dtype(v.dtype())?)
    }
}
