//! Causal attention score op: scaled `Q·Kᵀ` with triangular masking.
//!
//! Query row `i` sits at absolute position `past_len + i`, so key `j` is hidden
//! whenever `j > i + past_len`. Without a past this is the usual upper
//! triangle. The key length must equal `q_len + past_len`.

use candle_core::{Device, Result as CandleResult, Tensor};
use kernels::matmul::{FusedMatMul, MatMulOptions, MatMulSaved};
use kernels::registry::{
    input, tensor_map, AttrMap, Backend, GradientContext, KernelEntry, KernelRegistry, TensorMap,
};
use kernels::{checks, KernelError, Operand};

use crate::core::{AttentionError, Result};

/// Whether key `k` is hidden from query `q` given `past_len` cached positions.
#[inline]
pub fn is_masked(q: usize, k: usize, past_len: usize) -> bool {
    k > q + past_len
}

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> CandleResult<Tensor> {
    let total = batch * num_heads * q_len * k_len;
    let mut data = vec![0f32; total];

    let offset = k_len.saturating_sub(q_len);

    for b in 0..batch {
        for h in 0..num_heads {
            for q in 0..q_len {
                let row_start = ((((b * num_heads) + h) * q_len) + q) * k_len;
                for k in 0..k_len {
                    if is_masked(q, k, offset) {
                        data[row_start + k] = f32::NEG_INFINITY;
                    }
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}

/// Overwrites every masked entry of a `[.., q_len, k_len]` buffer.
fn fill_masked(values: &mut [f32], q_len: usize, k_len: usize, past_len: usize, fill: f32) {
    if q_len == 0 || k_len == 0 {
        return;
    }
    for block in values.chunks_mut(q_len * k_len) {
        for (q, row) in block.chunks_mut(k_len).enumerate() {
            for (k, value) in row.iter_mut().enumerate() {
                if is_masked(q, k, past_len) {
                    *value = fill;
                }
            }
        }
    }
}

/// Saved state of an [`AttentionMask`] forward pass.
#[derive(Debug, Clone)]
pub struct MaskSaved {
    scores: MatMulSaved,
    past_len: usize,
    q_len: usize,
    k_len: usize,
}

impl MaskSaved {
    pub fn past_len(&self) -> usize {
        self.past_len
    }
}

#[derive(Debug, Clone)]
pub struct MaskGrads {
    pub q: Operand,
    pub k: Operand,
}

/// Fused `scores = (Q·Kᵀ) * divisor` followed by the causal mask.
#[derive(Debug, Clone)]
pub struct AttentionMask {
    divisor: f32,
    scores: FusedMatMul,
}

impl AttentionMask {
    /// Uses the standard `1 / sqrt(head_dim)` divisor.
    pub fn new(head_dim: usize) -> Result<Self> {
        if head_dim == 0 {
            return Err(AttentionError::config("head_dim must be non-zero"));
        }
        Self::with_divisor(1.0 / (head_dim as f32).sqrt())
    }

    pub fn with_divisor(divisor: f32) -> Result<Self> {
        let scores = FusedMatMul::new(MatMulOptions {
            transpose_b: true,
            scale: Some(divisor),
            ..MatMulOptions::default()
        })?;
        Ok(Self { divisor, scores })
    }

    pub fn divisor(&self) -> f32 {
        self.divisor
    }

    /// `q` is `[B, H, q_len, D]`, `k` is `[B, H, q_len + past_len, D]`.
    pub fn forward(&self, q: &Operand, k: &Operand, past_len: usize) -> Result<(Operand, MaskSaved)> {
        checks::expect_rank("attention_mask.q", q.dims(), 4)?;
        checks::expect_rank("attention_mask.k", k.dims(), 4)?;
        let (qd, kd) = (q.dims(), k.dims());
        if qd[0] != kd[0] || qd[1] != kd[1] || qd[3] != kd[3] {
            return Err(AttentionError::InvalidShape {
                context: format!("attention_mask: q {:?} and k {:?} disagree", qd, kd),
            });
        }
        let (q_len, k_len) = (qd[2], kd[2]);
        if k_len != q_len + past_len {
            return Err(AttentionError::config(format!(
                "mask lengths disagree: k_len {k_len} != q_len {q_len} + past_len {past_len}"
            )));
        }

        let (scores, saved) = self.scores.forward(q, k)?;
        let masked = match &scores {
            Operand::Plain(t) => {
                let (b, h) = (qd[0], qd[1]);
                let mask = build_causal_mask(t.device(), b, h, q_len, k_len)?;
                Operand::Plain(t.add(&mask)?)
            }
            Operand::Packed(_) => {
                let mut values = scores.materialize()?;
                fill_masked(&mut values, q_len, k_len, past_len, f32::NEG_INFINITY);
                scores.like(values, scores.dims())?
            }
        };
        let saved = MaskSaved {
            scores: saved,
            past_len,
            q_len,
            k_len,
        };
        Ok((masked, saved))
    }

    /// `dQ = (dY·K)·divisor`, `dK = (dYᵀ·Q)·divisor`; masked entries carry no gradient.
    pub fn backward(&self, grad: &Operand, saved: &MaskSaved) -> Result<MaskGrads> {
        let mut values = grad.materialize()?;
        fill_masked(&mut values, saved.q_len, saved.k_len, saved.past_len, 0.0);
        let grad = grad.like(values, grad.dims())?;
        let grads = self.scores.backward(&grad, &saved.scores)?;
        Ok(MaskGrads {
            q: grads.a,
            k: grads.b,
        })
    }
}

/// One-shot masked scores.
pub fn attention_mask(q: &Operand, k: &Operand, divisor: f32, past_len: usize) -> Result<Operand> {
    Ok(AttentionMask::with_divisor(divisor)?.forward(q, k, past_len)?.0)
}

/// Registers the `AttentionMask` op. Inputs `q`, `k`; attributes `divisor`
/// (defaults to `1 / sqrt(head_dim)`) and `past_len`.
pub fn register_kernels(registry: &mut KernelRegistry) -> kernels::Result<()> {
    registry.register(
        "AttentionMask",
        Backend::Cpu,
        KernelEntry::new(mask_forward, mask_gradient),
    )
}

fn mask_op(q: &Operand, attrs: &AttrMap) -> kernels::Result<(AttentionMask, usize)> {
    checks::expect_rank("AttentionMask.q", q.dims(), 4)?;
    let default = 1.0 / (q.dims()[3].max(1) as f32).sqrt();
    let op = AttentionMask::with_divisor(attrs.f32_or("divisor", default)?).map_err(to_kernel_error)?;
    Ok((op, attrs.usize_or("past_len", 0)?))
}

fn mask_forward(inputs: &TensorMap, attrs: &AttrMap) -> kernels::Result<Operand> {
    let q = input(inputs, "AttentionMask", "q")?;
    let k = input(inputs, "AttentionMask", "k")?;
    let (op, past_len) = mask_op(q, attrs)?;
    op.forward(q, k, past_len).map(|(scores, _)| scores).map_err(to_kernel_error)
}

fn mask_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> kernels::Result<TensorMap> {
    let q = input(ctx.inputs, "AttentionMask", "q")?;
    let k = input(ctx.inputs, "AttentionMask", "k")?;
    let (op, past_len) = mask_op(q, ctx.attrs)?;
    let (_, saved) = op.forward(q, k, past_len).map_err(to_kernel_error)?;
    let grads = op.backward(grad, &saved).map_err(to_kernel_error)?;
    Ok(tensor_map([("q", grads.q), ("k", grads.k)]))
}

fn to_kernel_error(err: AttentionError) -> KernelError {
    match err {
        AttentionError::Config { message } => KernelError::Config(message),
        AttentionError::Usage { message } => KernelError::Usage(message),
        AttentionError::InvalidShape { context } => KernelError::Usage(context),
        AttentionError::Precision { message } => KernelError::Precision(message),
        AttentionError::Unsupported { op, detail } => KernelError::Unsupported { op, detail },
        AttentionError::Backend { message } => KernelError::Candle(candle_core::Error::Msg(message)),
    }
}
