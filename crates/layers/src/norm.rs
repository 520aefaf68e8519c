//! Layer normalisation over the trailing feature axis.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Mean and (biased)
//! variance are computed per position in [`PrecisionPolicy::reduction`]
//! precision before the learned affine transform is applied and the output is
//! cast back to the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether post-normalisation affine parameters are present.
    pub elementwise_affine: bool,
}

impl NormConfig {
    /// Creates a configuration with learnable scale/shift and `epsilon = 1e-5`.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// LayerNorm with optional learnable scale (`gamma`) and shift (`beta`).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = true;
        for (name, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(name, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(name, tensor, &checks::FLOAT_DTYPES)?;
        }
        Ok(Self {
            config,
            weight: Some(weight),
            bias: Some(bias),
        })
    }

    /// Fresh parameters: scale of ones, shift of zeros.
    pub fn init(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Constructs a LayerNorm without affine parameters (scale = 1, bias = 0).
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm hidden size must be non-zero".into()));
        }
        config.elementwise_affine = false;
        Ok(Self {
            config,
            weight: None,
            bias: None,
        })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;

    fn build_input(
        device: &Device,
        dtype: DType,
        batch: usize,
        seq: usize,
        hidden: usize,
    ) -> Result<Tensor> {
        let total = batch * seq * hidden;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (batch, seq, hidden), device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let (batch, seq, hidden) = (2, 3, 4);
        let config = NormConfig::new(hidden);

        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (hidden,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, batch, seq, hidden)?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::new(weight.clone(), bias.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(
                &input.to_dtype(DType::F32)?,
                &weight_f32,
                &bias_f32,
                config.epsilon as f32,
            )?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 5e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn init_is_identity_affine() -> Result<()> {
        let device = Device::Cpu;
        let config = NormConfig::new(2).with_epsilon(1e-12);
        let input = build_input(&device, DType::F32, 1, 3, 2)?;
        let policy = PrecisionPolicy::default();

        let fresh = LayerNorm::init(config.clone(), &device, DType::F32)?;
        let bare = LayerNorm::without_affine(config)?;
        let diff = max_diff(&fresh.forward(&input, &policy)?, &bare.forward(&input, &policy)?)?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn normalised_rows_have_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let layer = LayerNorm::init(NormConfig::new(16), &device, DType::F32)?;
        let input = Tensor::randn(3f32, 2.0, (2, 5, 16), &device)?;
        let out = layer.forward(&input, &PrecisionPolicy::default())?;
        let mean = out.mean_keepdim(D::Minus1)?;
        let var = out.broadcast_sub(&mean)?.sqr()?.mean_keepdim(D::Minus1)?;
        assert!(mean.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()? < 1e-4);
        let var_err = (var - 1.0)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        assert!(var_err < 1e-3);
        Ok(())
    }

    #[test]
    fn rejects_wrong_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let layer = LayerNorm::init(NormConfig::new(4), &device, DType::F32)?;
        let input = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        assert!(layer.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }
}
