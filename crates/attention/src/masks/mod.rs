//! Key-padding masks shared by attention strategies.
//!
//! Masks are keep-masks: non-zero entries mark positions that may be attended
//! and zero entries mark positions to suppress. Builders in this module return
//! `u8` tensors shaped `[batch, 1, length]`, which broadcast over heads.

pub mod padding;

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Dtype produced by the mask builders and by [`expand_key_mask`].
pub const MASK_DTYPE: DType = DType::U8;

pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// Normalises a caller-supplied key mask to a `u8` tensor of shape
/// `[batch, heads, length]`.
///
/// Accepted layouts are `[batch, length]`, `[batch, 1|heads, length]` and
/// `[batch, 1|heads, 1, length]`; `batch` may be `1` to broadcast over the
/// batch. Any numeric dtype is accepted, zero meaning "suppress".
pub fn expand_key_mask(
    mask: &Tensor,
    device: &Device,
    batch: usize,
    heads: usize,
    length: usize,
) -> Result<Tensor, AttentionError> {
    if !device.same_device(mask.device()) {
        return Err(AttentionError::shape(
            "mask must reside on the same device as q",
        ));
    }

    let mask3 = match mask.dims() {
        [_, _] => mask.unsqueeze(1)?,
        [_, _, _] => mask.clone(),
        [_, _, 1, _] => mask.squeeze(2)?,
        dims => {
            return Err(AttentionError::shape(format!(
                "mask must be broadcastable to [batch, head, length], got {:?}",
                dims
            )))
        }
    };

    let (mb, mh, ml) = mask3.dims3()?;
    if (mb != batch && mb != 1) || (mh != heads && mh != 1) || ml != length {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [{batch}|1, {heads}|1, {length}] got {:?}",
            mask.dims()
        )));
    }

    let keep = mask3.ne(&mask3.zeros_like()?)?;
    Ok(keep.broadcast_as((batch, heads, length))?.contiguous()?)
}
