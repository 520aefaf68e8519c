//! Activation catalogue for the encoder stack.
//!
//! Activations are shape preserving. Each evaluation promotes the input to
//! [`PrecisionPolicy::compute`] and casts the result back to the storage dtype
//! so reduced-precision parameters never evaluate a non-linearity in `f16`.
//!
//! * **ReLU** drives the position-wise feed-forward network.
//! * **Sigmoid** gates the gated linear unit.
//! * **Tanh** saturates additive attention scores.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies a built-in non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// Rectified linear unit: negative values clamp to zero.
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

impl ActivationKind {
    /// Applies the activation to `input` using the precision rules in `policy`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self {
            ActivationKind::Identity => compute,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(&compute)?,
            ActivationKind::Tanh => compute.tanh()?,
        };
        policy.cast_to_storage(&activated)
    }
}
