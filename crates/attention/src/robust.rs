//! Block-wise linear-complexity cosine-reweighted attention.
//!
//! Softmax attention is replaced by a non-negative feature map (ReLU) and a
//! position-dependent cosine reweighting that decomposes into a `sin` and a
//! `cos` half:
//!
//! ```text
//! cos(π/2 · (i - j) / m) = sin(a_i) sin(a_j) + cos(a_i) cos(a_j),   a_p = π/2 · p / m
//! ```
//!
//! so each query only needs running sums over keys already seen. Within a
//! block of `m` positions (1-indexed `p`):
//!
//! ```text
//! q~_p  = [q_p sin(a_p), q_p cos(a_p)]          (2 · d_tensor features)
//! k~_p  = [k_p sin(a_p), k_p cos(a_p)]
//! out_p = (q~_p · Σ_{j<=p} k~_j ⊗ v_j) / max(q~_p · Σ_{j<=p} k~_j, 1e-6)
//! ```
//!
//! The sequence is split into contiguous blocks that never interact, and the
//! reweighting angle restarts in every block.

use candle_core::{DType, Device, Tensor};
use layers::ExecutionContext;

use crate::core::{check_operands, AttentionError, AttentionStrategy, BlockRemainder, DEFAULT_BLOCK_SIZE};
use crate::masks::expand_key_mask;

/// Floor applied to the normaliser before division.
pub const DENOMINATOR_EPS: f64 = 1e-6;

/// Cosine-reweighted linear attention over fixed-size blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobustAttention {
    block_size: usize,
    remainder: BlockRemainder,
}

impl RobustAttention {
    /// Creates the strategy; `block_size` must be non-zero.
    pub fn new(block_size: usize) -> Result<Self, AttentionError> {
        if block_size == 0 {
            return Err(AttentionError::shape("robust attention block size must be non-zero"));
        }
        let remainder = BlockRemainder::default();
        log::info!("attention::robust init block_size={block_size} remainder={remainder:?}");
        Ok(Self {
            block_size,
            remainder,
        })
    }

    pub fn with_remainder(mut self, remainder: BlockRemainder) -> Self {
        self.remainder = remainder;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn remainder(&self) -> BlockRemainder {
        self.remainder
    }

    /// `(start, len)` of every block tiling `length`.
    fn blocks(&self, length: usize) -> Result<Vec<(usize, usize)>, AttentionError> {
        if length % self.block_size != 0 && self.remainder == BlockRemainder::Reject {
            return Err(AttentionError::shape(format!(
                "sequence length {length} is not divisible by block size {}",
                self.block_size
            )));
        }
        Ok((0..length)
            .step_by(self.block_size)
            .map(|start| (start, self.block_size.min(length - start)))
            .collect())
    }
}

impl Default for RobustAttention {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            remainder: BlockRemainder::default(),
        }
    }
}

impl AttentionStrategy for RobustAttention {
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ExecutionContext,
    ) -> Result<Tensor, AttentionError> {
        let dims = check_operands(&[("q", q), ("k", k), ("v", v)], ctx)?;
        let blocks = self.blocks(dims.length)?;
        log::debug!(
            "attention::robust length={} blocks={} block_size={}",
            dims.length,
            blocks.len(),
            self.block_size
        );

        let policy = ctx.policy();
        let q_pos = policy.cast_for_reduction(q)?.relu()?;
        let mut k_pos = policy.cast_for_reduction(k)?.relu()?;
        let mut v_pos = policy.cast_for_reduction(v)?.relu()?;

        // Masked keys and values are zeroed so they never enter a running sum.
        if let Some(mask) = mask {
            let keep = expand_key_mask(mask, ctx.device(), dims.batch, dims.heads, dims.length)?
                .to_dtype(k_pos.dtype())?
                .unsqueeze(3)?;
            k_pos = k_pos.broadcast_mul(&keep)?;
            v_pos = v_pos.broadcast_mul(&keep)?;
        }

        let mut outputs = Vec::with_capacity(blocks.len());
        for (start, len) in blocks {
            outputs.push(cos_reweight(
                &q_pos.narrow(2, start, len)?,
                &k_pos.narrow(2, start, len)?,
                &v_pos.narrow(2, start, len)?,
            )?);
        }
        let output = Tensor::cat(&outputs, 2)?;
        Ok(output.to_dtype(v.dtype())?)
    }
}

/// Reweighting angles `π/2 · p / m` for `p = 1..=m`, shaped `[1, m, 1]`.
fn reweighting_angles(m: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let angles = (1..=m)
        .map(|p| std::f64::consts::FRAC_PI_2 * p as f64 / m as f64)
        .collect::<Vec<_>>();
    Tensor::from_vec(angles, (1, m, 1), device)?.to_dtype(dtype)
}

/// Inclusive running sum along `dim`, accumulated in ascending position order.
fn inclusive_prefix_sum(x: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let len = x.dim(dim)?;
    let mut running = x.narrow(dim, 0, 1)?;
    let mut steps = Vec::with_capacity(len);
    steps.push(running.clone());
    for position in 1..len {
        running = running.add(&x.narrow(dim, position, 1)?)?;
        steps.push(running.clone());
    }
    Tensor::cat(&steps, dim)
}

/// Attention inside one block of already rectified `[batch, head, m, d]` inputs.
fn cos_reweight(q: &Tensor, k: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, heads, m, d) = q.dims4()?;
    let rows = batch * heads;
    let q = q.reshape((rows, m, d))?;
    let k = k.reshape((rows, m, d))?;
    let v = v.reshape((rows, m, d))?;

    let angles = reweighting_angles(m, q.device(), q.dtype())?;
    let (sin, cos) = (angles.sin()?, angles.cos()?);
    // [rows, m, 2d]
    let q_ = Tensor::cat(&[q.broadcast_mul(&sin)?, q.broadcast_mul(&cos)?], 2)?;
    let k_ = Tensor::cat(&[k.broadcast_mul(&sin)?, k.broadcast_mul(&cos)?], 2)?;

    // [rows, m, 2d, d]
    let kv = k_.unsqueeze(3)?.broadcast_mul(&v.unsqueeze(2)?)?;
    let kv_cum = inclusive_prefix_sum(&kv, 1)?;
    // [rows, m, d]
    let numerator = q_.unsqueeze(3)?.broadcast_mul(&kv_cum)?.sum(2)?;

    let k_cum = inclusive_prefix_sum(&k_, 1)?;
    // [rows, m]
    let denominator = q_.mul(&k_cum)?.sum(2)?;
    let floor = (denominator.ones_like()? * DENOMINATOR_EPS)?;
    let denominator = denominator.maximum(&floor)?;

    numerator
        .broadcast_div(&denominator.unsqueeze(2)?)?
        .reshape((batch, heads, m, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::eval(Device::Cpu)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    fn random_qkv(shape: (usize, usize, usize, usize)) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let device = Device::Cpu;
        Ok((
            Tensor::randn(0.3f32, 1.0, shape, &device)?,
            Tensor::randn(0.3f32, 1.0, shape, &device)?,
            Tensor::randn(0.3f32, 1.0, shape, &device)?,
        ))
    }

    /// Direct evaluation of the quadratic form the running sums replace.
    fn naive_block(q: &Tensor, k: &Tensor, v: &Tensor) -> candle_core::Result<Vec<f32>> {
        let (batch, heads, m, d) = q.dims4()?;
        let q = q.relu()?.flatten_all()?.to_vec1::<f32>()?;
        let k = k.relu()?.flatten_all()?.to_vec1::<f32>()?;
        let v = v.relu()?.flatten_all()?.to_vec1::<f32>()?;
        let angle = |p: usize| std::f64::consts::FRAC_PI_2 * (p + 1) as f64 / m as f64;
        let mut out = vec![0f32; batch * heads * m * d];
        for bh in 0..batch * heads {
            let at = |p: usize, f: usize| (bh * m + p) * d + f;
            for i in 0..m {
                let mut weights = Vec::with_capacity(i + 1);
                for j in 0..=i {
                    let dot: f32 = (0..d).map(|f| q[at(i, f)] * k[at(j, f)]).sum();
                    weights.push(dot * (angle(i) - angle(j)).cos() as f32);
                }
                let denom = weights.iter().sum::<f32>().max(DENOMINATOR_EPS as f32);
                for f in 0..d {
                    let num: f32 = (0..=i).map(|j| weights[j] * v[at(j, f)]).sum();
                    out[at(i, f)] = num / denom;
                }
            }
        }
        Ok(out)
    }

    #[test]
    fn single_block_matches_naive_quadratic_form() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((2, 2, 6, 3))?;
        let out = RobustAttention::new(6)?.compute(&q, &k, &v, None, &ctx())?;
        let expected = naive_block(&q, &k, &v)?;
        let actual = out.flatten_all()?.to_vec1::<f32>()?;
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-4 * (1.0 + e.abs()), "{a} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn constant_inputs_reproduce_values() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let ones = Tensor::ones((2, 1, 15, 4), DType::F32, &device)?;
        let out = RobustAttention::new(15)?.compute(&ones, &ones, &ones, None, &ctx())?;
        assert_eq!(out.dims(), &[2, 1, 15, 4]);
        assert!(max_abs_diff(&out, &ones)? < 1e-5);
        Ok(())
    }

    #[test]
    fn zero_keys_stay_finite() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, _, v) = random_qkv((1, 2, 15, 4))?;
        let k = Tensor::zeros((1, 2, 15, 4), DType::F32, &device)?;
        let out = RobustAttention::default().compute(&q, &k, &v, None, &ctx())?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|x| x.is_finite()));
        assert!(values.iter().all(|x| *x == 0.0));
        Ok(())
    }

    #[test]
    fn negative_values_are_rectified() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 5, 2), DType::F32, &device)?;
        let v = Tensor::full(-3f32, (1, 1, 5, 2), &device)?;
        let out = RobustAttention::new(5)?.compute(&q, &q, &v, None, &ctx())?;
        assert_eq!(max_abs_diff(&out, &v.zeros_like()?)?, 0.0);
        Ok(())
    }

    #[test]
    fn blocks_are_computed_independently() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((2, 3, 30, 4))?;
        let blocked = RobustAttention::new(15)?.compute(&q, &k, &v, None, &ctx())?;
        assert_eq!(blocked.dims(), v.dims());

        for start in [0, 15] {
            let slice = |t: &Tensor| t.narrow(2, start, 15);
            let alone = RobustAttention::new(15)?.compute(&slice(&q)?, &slice(&k)?, &slice(&v)?, None, &ctx())?;
            assert!(max_abs_diff(&blocked.narrow(2, start, 15)?, &alone)? < 1e-5);
        }

        // The angle restarts per block, so one global block is a different model.
        let global = RobustAttention::new(30)?.compute(&q, &k, &v, None, &ctx())?;
        assert!(max_abs_diff(&blocked.narrow(2, 15, 15)?, &global.narrow(2, 15, 15)?)? > 1e-3);
        Ok(())
    }

    #[test]
    fn block_size_changes_the_result() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((1, 1, 20, 3))?;
        let five = RobustAttention::new(5)?.compute(&q, &k, &v, None, &ctx())?;
        let twenty = RobustAttention::new(20)?.compute(&q, &k, &v, None, &ctx())?;
        assert_eq!(five.dims(), twenty.dims());
        assert!(max_abs_diff(&five, &twenty)? > 1e-3);
        Ok(())
    }

    #[test]
    fn partial_final_block_is_processed_on_its_own() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((1, 2, 20, 4))?;
        let attention = RobustAttention::new(15)?;
        let out = attention.compute(&q, &k, &v, None, &ctx())?;
        assert_eq!(out.dims(), v.dims());

        let tail = |t: &Tensor| t.narrow(2, 15, 5);
        let alone = attention.compute(&tail(&q)?, &tail(&k)?, &tail(&v)?, None, &ctx())?;
        assert!(max_abs_diff(&out.narrow(2, 15, 5)?, &alone)? < 1e-5);
        Ok(())
    }

    #[test]
    fn block_larger_than_length_is_one_block() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((1, 1, 7, 2))?;
        let oversized = RobustAttention::new(15)?.compute(&q, &k, &v, None, &ctx())?;
        let exact = RobustAttention::new(7)?.compute(&q, &k, &v, None, &ctx())?;
        assert!(max_abs_diff(&oversized, &exact)? < 1e-6);
        Ok(())
    }

    #[test]
    fn reject_policy_refuses_indivisible_lengths() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((1, 1, 20, 4))?;
        let strict = RobustAttention::new(15)?.with_remainder(BlockRemainder::Reject);
        let err = strict.compute(&q, &k, &v, None, &ctx()).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let (q, k, v) = random_qkv((1, 1, 30, 4))?;
        assert_eq!(strict.compute(&q, &k, &v, None, &ctx())?.dims(), &[1, 1, 30, 4]);
        Ok(())
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(matches!(
            RobustAttention::new(0),
            Err(AttentionError::InvalidShape { .. })
        ));
    }

    #[test]
    fn masked_keys_do_not_contribute() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = random_qkv((1, 2, 6, 3))?;
        let mask = Tensor::from_vec(vec![1u8, 1, 0, 1, 1, 1], (1, 6), &device)?;
        let attention = RobustAttention::new(6)?;
        let out = attention.compute(&q, &k, &v, Some(&mask), &ctx())?;

        // Perturbing the masked position's key and value changes nothing.
        let bump = Tensor::from_vec(vec![0f32, 0., 5., 0., 0., 0.], (1, 1, 6, 1), &device)?;
        let k2 = k.broadcast_add(&bump)?;
        let v2 = v.broadcast_add(&bump)?;
        let perturbed = attention.compute(&q, &k2, &v2, Some(&mask), &ctx())?;
        assert!(max_abs_diff(&out, &perturbed)? < 1e-6);

        // Without the mask the same perturbation is visible downstream.
        let open = attention.compute(&q, &k, &v, None, &ctx())?;
        let open_perturbed = attention.compute(&q, &k2, &v2, None, &ctx())?;
        assert!(max_abs_diff(&open.narrow(2, 2, 4)?, &open_perturbed.narrow(2, 2, 4)?)? > 1e-4);
        Ok(())
    }

    #[test]
    fn prefix_sum_runs_in_position_order() -> candle_core::Result<()> {
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4., 10., 20., 30., 40.], (2, 4), &Device::Cpu)?;
        let summed = inclusive_prefix_sum(&x, 1)?;
        assert_eq!(
            summed.to_vec2::<f32>()?,
            vec![vec![1., 3., 6., 10.], vec![10., 30., 60., 100.]]
        );
        Ok(())
    }

    #[test]
    fn reduced_precision_inputs_keep_their_dtype() -> Result<(), AttentionError> {
        let (q, k, v) = random_qkv((1, 2, 15, 4))?;
        let attention = RobustAttention::default();
        let reference = attention.compute(&q, &k, &v, None, &ctx())?;
        for dtype in [DType::F16, DType::BF16] {
            let out = attention.compute(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                None,
                &ctx(),
            )?;
            assert_eq!(out.dtype(), dtype);
            let diff = max_abs_diff(&out, &reference)?;
            assert!(diff < 1e-1, "{dtype:?} diverged by {diff}");
        }
        Ok(())
    }
}
