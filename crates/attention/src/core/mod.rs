//! Core traits and types shared across attention strategies.
//!
//! Strategies operate on head-partitioned tensors with layout
//! `[batch, head, length, d_tensor]`. The output mirrors the shape of `V` and
//! its dtype. Intermediate reductions run in the precision policy's reduction
//! dtype (`f32` for reduced-precision inputs).

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};
use layers::ExecutionContext;

pub use config::{AttentionKind, BlockRemainder, DEFAULT_BLOCK_SIZE};
pub use errors::AttentionError;

/// Capability shared by every attention strategy.
///
/// * `q`, `k` and `v` share the layout `[batch, head, length, d_tensor]`.
/// * The returned tensor has exactly the shape and dtype of `v`.
/// * `mask`, when present, is a key mask broadcastable to
///   `[batch, head, length]`; zero entries mark suppressed positions. See
///   [`crate::masks::expand_key_mask`] for accepted layouts.
/// * Implementations are pure functions of their inputs and parameters.
pub trait AttentionStrategy {
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError>;
}

/// Axis sizes of validated attention operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadDims {
    pub batch: usize,
    pub heads: usize,
    pub length: usize,
    pub d_tensor: usize,
}

/// Checks that every operand is a non-empty rank-4 float tensor on the context
/// device and that all operands agree in shape and dtype.
pub(crate) fn check_operands(
    operands: &[(&str, &Tensor)],
    ctx: &ExecutionContext,
) -> Result<HeadDims, AttentionError> {
    let (first_name, first) = operands
        .first()
        .ok_or_else(|| AttentionError::shape("no operands supplied"))?;

    let dtype = first.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, heads, length, d_tensor) = first.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{first_name} must have shape [batch, head, length, d_tensor], got {:?}",
            first.dims()
        ))
    })?;
    if batch == 0 || heads == 0 || length == 0 || d_tensor == 0 {
        return Err(AttentionError::shape(format!(
            "{first_name} axes must be non-zero, got {:?}",
            first.dims()
        )));
    }

    for (name, tensor) in operands {
        if !ctx.device().same_device(tensor.device()) {
            return Err(AttentionError::shape(format!(
                "{name} must reside on the context device"
            )));
        }
        if tensor.dims() != first.dims() {
            return Err(AttentionError::shape(format!(
                "{name} shape mismatch: expected {:?} got {:?}",
                first.dims(),
                tensor.dims()
            )));
        }
        if tensor.dtype() != dtype {
            return Err(AttentionError::shape(format!(
                "{name} dtype {:?} does not match {first_name} dtype {dtype:?}",
                tensor.dtype()
            )));
        }
    }

    Ok(HeadDims {
        batch,
        heads,
        length,
        d_tensor,
    })
}
