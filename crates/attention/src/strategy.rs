//! Runtime dispatch over the closed set of attention strategies.

use candle_core::{DType, Device, Tensor};
use layers::ExecutionContext;

use crate::additive::AdditiveAttention;
use crate::core::{AttentionError, AttentionKind, AttentionStrategy};
use crate::robust::RobustAttention;

/// A constructed attention strategy, chosen once per layer.
#[derive(Debug, Clone)]
pub enum Strategy {
    Additive(AdditiveAttention),
    Robust(RobustAttention),
}

impl Strategy {
    /// Builds the strategy described by `kind` for heads of width `d_tensor`.
    pub fn from_kind(
        kind: &AttentionKind,
        d_tensor: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        match kind {
            AttentionKind::Additive => Ok(Self::Additive(AdditiveAttention::new(
                d_tensor, device, dtype,
            )?)),
            AttentionKind::Robust {
                block_size,
                remainder,
            } => Ok(Self::Robust(
                RobustAttention::new(*block_size)?.with_remainder(*remainder),
            )),
        }
    }

    /// Serialisable description of this strategy.
    pub fn kind(&self) -> AttentionKind {
        match self {
            Self::Additive(_) => AttentionKind::Additive,
            Self::Robust(robust) => AttentionKind::Robust {
                block_size: robust.block_size(),
                remainder: robust.remainder(),
            },
        }
    }
}

impl AttentionStrategy for Strategy {
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError> {
        match self {
            Self::Additive(additive) => additive.compute(q, k, v, mask, ctx),
            Self::Robust(robust) => robust.compute(q, k, v, mask, ctx),
        }
    }
}
