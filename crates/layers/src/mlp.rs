//! Position-wise feed-forward blocks.
//!
//! Both variants map `(batch, seq, hidden)` to the same layout, expanding to
//! `config.intermediate_size` in between:
//!
//! * [`PositionwiseFeedForward`]: `W2 · dropout(relu(W1 · x))`.
//! * [`GatedLinearUnit`]: `Wo · dropout((Wv · x) ⊙ sigmoid(Wg · x))`.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::ActivationKind,
    checks,
    context::ExecutionContext,
    linear::{Linear, LinearConfig, LinearInit},
    residual::Dropout,
};

/// Configuration shared by feed-forward variants.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Dropout applied to the activated intermediate tensor.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, dropout_p: f32) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            dropout_p,
        }
    }

    fn expand(&self, device: &Device, dtype: DType) -> Result<Linear> {
        Linear::with_init(
            LinearConfig::new(self.hidden_size, self.intermediate_size),
            &LinearInit::torch_default(),
            device,
            dtype,
        )
    }

    fn contract(&self, device: &Device, dtype: DType) -> Result<Linear> {
        Linear::with_init(
            LinearConfig::new(self.intermediate_size, self.hidden_size),
            &LinearInit::torch_default(),
            device,
            dtype,
        )
    }
}

/// Two dense layers with a ReLU and dropout in between.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    config: FeedForwardConfig,
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            linear1: config.expand(device, dtype)?,
            linear2: config.contract(device, dtype)?,
            dropout: Dropout::new(config.dropout_p)?,
            config,
        })
    }

    pub fn forward(&self, hidden: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("ffn.input", hidden, self.config.hidden_size)?;
        let policy = ctx.policy();
        let x = self.linear1.forward(hidden, policy)?;
        let x = ActivationKind::Relu.forward(&x, policy)?;
        let x = self.dropout.forward(&x, ctx)?;
        self.linear2.forward(&x, policy)
    }
}

/// Gated linear unit: a sigmoid gate modulates a parallel value projection.
#[derive(Debug, Clone)]
pub struct GatedLinearUnit {
    config: FeedForwardConfig,
    value: Linear,
    gate: Linear,
    output: Linear,
    dropout: Dropout,
}

impl GatedLinearUnit {
    pub fn new(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            value: config.expand(device, dtype)?,
            gate: config.expand(device, dtype)?,
            output: config.contract(device, dtype)?,
            dropout: Dropout::new(config.dropout_p)?,
            config,
        })
    }

    pub fn forward(&self, hidden: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("glu.input", hidden, self.config.hidden_size)?;
        let policy = ctx.policy();
        let value = self.value.forward(hidden, policy)?;
        let gate = ActivationKind::Sigmoid.forward(&self.gate.forward(hidden, policy)?, policy)?;
        let gated = value.mul(&gate)?;
        let gated = self.dropout.forward(&gated, ctx)?;
        self.output.forward(&gated, policy)
    }
}

/// Closed set of feed-forward sublayers selectable at construction time.
#[derive(Debug, Clone)]
pub enum FeedForward {
    Positionwise(PositionwiseFeedForward),
    Gated(GatedLinearUnit),
}

impl FeedForward {
    pub fn config(&self) -> &FeedForwardConfig {
        match self {
            FeedForward::Positionwise(ffn) => &ffn.config,
            FeedForward::Gated(glu) => &glu.config,
        }
    }

    pub fn forward(&self, hidden: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        match self {
            FeedForward::Positionwise(ffn) => ffn.forward(hidden, ctx),
            FeedForward::Gated(glu) => glu.forward(hidden, ctx),
        }
    }
}
