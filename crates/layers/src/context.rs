//! Per-call execution context.
//!
//! Device placement, train/eval mode and dropout randomness are carried
//! explicitly through every forward pass instead of living in process-wide
//! state. A context can be shared across concurrent inference calls; in
//! training mode the dropout RNG is serialised behind a mutex.

use std::sync::Mutex;

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Whether stochastic layers (dropout) are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Dropout samples fresh keep-masks from the context RNG.
    Train,
    /// Dropout is the identity and the forward pass is deterministic.
    Eval,
}

/// Explicit context threaded through every forward call.
#[derive(Debug)]
pub struct ExecutionContext {
    device: Device,
    mode: ForwardMode,
    policy: PrecisionPolicy,
    rng: Mutex<Lcg64>,
}

impl ExecutionContext {
    /// Inference context: dropout disabled, `f32` precision policy.
    pub fn eval(device: Device) -> Self {
        Self {
            device,
            mode: ForwardMode::Eval,
            policy: PrecisionPolicy::default(),
            rng: Mutex::new(Lcg64::new(0)),
        }
    }

    /// Training context whose dropout masks are drawn from a seeded generator.
    pub fn train(device: Device, seed: u64) -> Self {
        Self {
            device,
            mode: ForwardMode::Train,
            policy: PrecisionPolicy::default(),
            rng: Mutex::new(Lcg64::new(seed)),
        }
    }

    /// Replaces the precision policy (e.g. for `f16`/`bf16` parameters).
    pub fn with_policy(mut self, policy: PrecisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> ForwardMode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode == ForwardMode::Train
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    /// Fails unless `tensor` lives on the context device.
    pub fn expect_on_device(&self, name: &str, tensor: &Tensor) -> Result<()> {
        if self.device.same_device(tensor.device()) {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "{name} must reside on the context device {:?}, found {:?}",
                self.device.location(),
                tensor.device().location()
            )))
        }
    }

    /// Draws a `{0, 1}` keep-mask with the given shape and keep probability.
    pub fn keep_mask(&self, dims: &[usize], keep_prob: f32, dtype: DType) -> Result<Tensor> {
        let total: usize = dims.iter().product();
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
        let mut data = Vec::with_capacity(total);
        for _ in 0..total {
            data.push(if rng.next_f32() < keep_prob { 1.0f32 } else { 0.0f32 });
        }
        Tensor::from_vec(data, dims.to_vec(), &self.device)?.to_dtype(dtype)
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
