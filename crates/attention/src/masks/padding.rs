//! Builders for key-padding masks.
//!
//! All builders produce [`MASK_DTYPE`](super::MASK_DTYPE) tensors shaped
//! `[batch, 1, length]` with `1` for real tokens and `0` for padding.

use candle_core::{Device, Error, Result, Tensor};

use super::MASK_DTYPE;

/// Construct padding masks from per-batch valid lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    valid_lengths: &[usize],
    length: usize,
) -> Result<Tensor> {
    let batch = valid_lengths.len();
    let mut data = vec![0u8; batch * length];

    for (b, &valid) in valid_lengths.iter().enumerate() {
        let row = &mut data[b * length..(b + 1) * length];
        row[..valid.min(length)].fill(1);
    }

    Tensor::from_vec(data, (batch, 1, length), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (suppressed) position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let length = padding.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = padding.iter().find(|row| row.len() != length) {
        return Err(Error::Msg(format!(
            "all boolean padding rows must share length {length}, found {}",
            row.len()
        )));
    }

    if padding.is_empty() {
        return Tensor::zeros((0, 1, 0), MASK_DTYPE, device);
    }

    let data = padding
        .iter()
        .flat_map(|row| row.iter().map(|&is_padding| u8::from(!is_padding)))
        .collect::<Vec<_>>();

    Tensor::from_vec(data, (padding.len(), 1, length), device)
}
