//! Dropout and post-norm residual wiring.
//!
//! Dropout is inverted: surviving activations are scaled by `1 / (1 - p)` so
//! the expected value is unchanged and evaluation needs no rescaling. Keep
//! masks come from the [`ExecutionContext`] RNG; in
//! [`ForwardMode::Eval`](crate::context::ForwardMode::Eval) dropout is the
//! identity.

use candle_core::{Error, Result, Tensor};

use crate::{checks, context::ExecutionContext, norm::LayerNorm};

/// Probabilistic zeroing applied only while training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    /// Creates a dropout layer; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn forward(&self, tensor: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        if !ctx.is_training() || self.probability == 0.0 {
            return Ok(tensor.clone());
        }
        let policy = ctx.policy();
        let keep_prob = 1.0 - self.probability;
        let mask = ctx.keep_mask(tensor.dims(), keep_prob, policy.compute())?;
        let compute = policy.cast_for_matmul(tensor)?;
        let dropped = (compute.mul(&mask)? * (1.0 / keep_prob as f64))?;
        policy.cast_to_storage(&dropped)
    }
}

/// Post-norm residual step: `norm(residual + dropout(branch))`.
#[derive(Debug, Clone)]
pub struct Residual {
    dropout: Dropout,
    norm: LayerNorm,
}

impl Residual {
    pub fn new(dropout: Dropout, norm: LayerNorm) -> Self {
        Self { dropout, norm }
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    /// Applies dropout to `branch`, adds `residual`, then normalises.
    pub fn postnorm_step(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        ctx: &ExecutionContext,
    ) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let policy = ctx.policy();
        let branch = self.dropout.forward(branch, ctx)?;
        let added = policy
            .cast_for_matmul(&branch)?
            .add(&policy.cast_for_matmul(residual)?)?;
        let added = policy.cast_to_storage(&added)?;
        self.norm.forward(&added, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::NormConfig;
    use candle_core::{DType, Device};

    #[test]
    fn dropout_respects_probability_and_seed() -> Result<()> {
        let device = Device::Cpu;
        let dropout = Dropout::new(0.25)?;
        let input = Tensor::ones((4, 8, 16), DType::F32, &device)?;

        let first = dropout.forward(&input, &ExecutionContext::train(device.clone(), 123))?;
        let second = dropout.forward(&input, &ExecutionContext::train(device.clone(), 123))?;

        let values = first.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().copied().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.1);
        assert!(values.iter().any(|v| *v == 0.0));
        assert_eq!(values, second.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn dropout_disabled_in_inference() -> Result<()> {
        let device = Device::Cpu;
        let dropout = Dropout::new(0.5)?;
        let input = Tensor::randn(0f32, 1.0, (2, 2, 4), &device)?;
        let out = dropout.forward(&input, &ExecutionContext::eval(device))?;
        let diff = input.sub(&out)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn dropout_rejects_out_of_range_probability() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn postnorm_step_adds_then_normalises() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::without_affine(NormConfig::new(3))?;
        let residual = Residual::new(Dropout::new(0.0)?, norm);
        let branch = Tensor::from_vec(vec![1.0f32, 0.0, -1.0], (1, 1, 3), &device)?;
        let parent = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], (1, 1, 3), &device)?;

        let out = residual.postnorm_step(&branch, &parent, &ExecutionContext::eval(device))?;
        // residual + branch = [2, 2, 2] normalises to zeros.
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.abs() < 1e-3));
        Ok(())
    }
}
