//! Casting rules for reduced-precision encoders.
//!
//! Weights and activations are stored in the parameter dtype. Matmuls,
//! non-linearities and every reduction (norm statistics, softmax, the running
//! sums and denominators of robust attention) are promoted to `f32` whenever
//! the storage dtype is `f16` or `bf16`.

use candle_core::{DType, Result, Tensor};

/// Storage, compute and reduction dtypes of one forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Policy for parameters stored as `storage`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let promoted = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self {
            storage,
            compute: promoted,
            reduction: promoted,
        }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn half_precision_parameters_promote_to_f32() {
        for dtype in [DType::F16, DType::BF16] {
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            assert_eq!(policy.storage(), dtype);
            assert_eq!(policy.compute(), DType::F32);
            assert_eq!(policy.reduction(), DType::F32);
        }
        let full = PrecisionPolicy::default();
        assert_eq!((full.storage(), full.compute()), (DType::F32, DType::F32));
    }

    #[test]
    fn casts_skip_matching_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let stored = Tensor::new(&[0.5f32, -2.0, 8.0], &device)?.to_dtype(DType::BF16)?;

        let promoted = policy.cast_for_reduction(&stored)?;
        assert_eq!(promoted.dtype(), DType::F32);
        assert_eq!(promoted.to_vec1::<f32>()?, vec![0.5, -2.0, 8.0]);

        let back = policy.cast_to_storage(&promoted)?;
        assert_eq!(back.dtype(), DType::BF16);
        assert_eq!(policy.cast_to_storage(&back)?.dtype(), DType::BF16);
        Ok(())
    }
}
