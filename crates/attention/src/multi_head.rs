//! Multi-head wrapper that projects, splits, attends and recombines.

use candle_core::{DType, Device, Tensor};
use layers::{
    linear::{Linear, LinearConfig, LinearInit},
    ExecutionContext,
};

use crate::core::{AttentionError, AttentionKind, AttentionStrategy};
use crate::strategy::Strategy;

/// Multi-head attention over `[batch, length, d_model]` inputs.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    d_model: usize,
    n_head: usize,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_concat: Linear,
    strategy: Strategy,
}

fn projection(d_model: usize, device: &Device, dtype: DType) -> Result<Linear, AttentionError> {
    Ok(Linear::with_init(
        LinearConfig::new(d_model, d_model),
        &LinearInit::torch_default(),
        device,
        dtype,
    )?)
}

impl MultiHeadAttention {
    pub fn new(
        d_model: usize,
        n_head: usize,
        kind: &AttentionKind,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        if d_model == 0 || n_head == 0 || d_model % n_head != 0 {
            return Err(AttentionError::shape(format!(
                "d_model {d_model} must be a non-zero multiple of n_head {n_head}"
            )));
        }
        let strategy = Strategy::from_kind(kind, d_model / n_head, device, dtype)?;
        Ok(Self {
            d_model,
            n_head,
            w_q: projection(d_model, device, dtype)?,
            w_k: projection(d_model, device, dtype)?,
            w_v: projection(d_model, device, dtype)?,
            w_concat: projection(d_model, device, dtype)?,
            strategy,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn n_head(&self) -> usize {
        self.n_head
    }

    pub fn d_tensor(&self) -> usize {
        self.d_model / self.n_head
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    fn batch_and_length(&self, name: &str, tensor: &Tensor) -> Result<(usize, usize), AttentionError> {
        match tensor.dims() {
            [batch, length, hidden] if *hidden == self.d_model => Ok((*batch, *length)),
            dims => Err(AttentionError::shape(format!(
                "{name} expected [batch, length, {}] got {dims:?}",
                self.d_model
            ))),
        }
    }

    /// `[batch, length, d_model]` to `[batch, head, length, d_tensor]`.
    fn split(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, length, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, length, self.n_head, self.d_tensor()))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Inverse of [`Self::split`].
    fn concat(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, _, length, _) = tensor.dims4()?;
        Ok(tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, length, self.d_model))?)
    }

    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError> {
        let expected = self.batch_and_length("q", q)?;
        for (name, tensor) in [("k", k), ("v", v)] {
            if self.batch_and_length(name, tensor)? != expected {
                return Err(AttentionError::shape(format!(
                    "{name} shape {:?} does not match q shape {:?}",
                    tensor.dims(),
                    q.dims()
                )));
            }
        }

        let policy = ctx.policy();
        let q = self.split(&self.w_q.forward(q, policy)?)?;
        let k = self.split(&self.w_k.forward(k, policy)?)?;
        let v = self.split(&self.w_v.forward(v, policy)?)?;

        let heads = self.strategy.compute(&q, &k, &v, mask, ctx)?;
        Ok(self.w_concat.forward(&self.concat(&heads)?, policy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::padding_mask_from_lengths;

    fn ctx() -> ExecutionContext {
        ExecutionContext::eval(Device::Cpu)
    }

    #[test]
    fn indivisible_model_width_is_rejected() {
        let err = MultiHeadAttention::new(10, 3, &AttentionKind::Additive, &Device::Cpu, DType::F32)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn split_and_concat_are_inverse() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(12, 3, &AttentionKind::Additive, &device, DType::F32)?;
        let x = Tensor::arange(0f32, 2. * 5. * 12., &device)?.reshape((2, 5, 12))?;
        let heads = mha.split(&x)?;
        assert_eq!(heads.dims(), &[2, 3, 5, 4]);
        // Head 1 of position 0 holds features 4..8.
        assert_eq!(
            heads.get(0)?.get(1)?.get(0)?.to_vec1::<f32>()?,
            vec![4., 5., 6., 7.]
        );
        let back = mha.concat(&heads)?;
        assert_eq!(back.to_vec3::<f32>()?, x.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn forward_preserves_shape_for_every_strategy() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 20, 16), &device)?;
        let mask = padding_mask_from_lengths(&device, &[20, 12], 20)?;
        for kind in [AttentionKind::Additive, AttentionKind::robust()] {
            let mha = MultiHeadAttention::new(16, 4, &kind, &device, DType::F32)?;
            assert_eq!(mha.strategy().kind(), kind);
            let out = mha.forward(&x, &x, &x, Some(&mask), &ctx())?;
            assert_eq!(out.dims(), &[2, 20, 16]);
        }
        Ok(())
    }

    #[test]
    fn mismatched_inputs_are_rejected() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(8, 2, &AttentionKind::Additive, &device, DType::F32)?;
        let x = Tensor::zeros((1, 4, 8), DType::F32, &device)?;
        let wide = Tensor::zeros((1, 4, 6), DType::F32, &device)?;
        let short = Tensor::zeros((1, 3, 8), DType::F32, &device)?;
        assert!(mha.forward(&wide, &wide, &wide, None, &ctx()).is_err());
        assert!(mha.forward(&x, &short, &x, None, &ctx()).is_err());
        Ok(())
    }
}
