//! Unfused attention built from plain candle ops.
//!
//! Every step materialises its own tensor (`QKᵀ`, scale, additive mask,
//! softmax and `PV`), which makes this path the baseline the fused kernels and
//! [`CausalSelfAttention`](crate::module::CausalSelfAttention) are validated
//! against.

use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;
use embedding::positional::rope::RotaryEmbedding;
use kernels::Operand;

use crate::core::{AttentionError, Result};
use crate::masks::build_causal_mask;

/// Exact causal attention over plain `[B, H, T, D]` tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExactAttention {
    divisor: f32,
}

impl ExactAttention {
    /// Scores are multiplied by `1 / sqrt(head_dim)`.
    pub fn new(head_dim: usize) -> Self {
        Self {
            divisor: 1.0 / (head_dim as f32).sqrt(),
        }
    }

    pub fn divisor(&self) -> f32 {
        self.divisor
    }

    /// Masked, scaled scores `QKᵀ · divisor` with `-inf` above the causal diagonal.
    pub fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if k_len < q_len {
            return Err(AttentionError::InvalidShape {
                context: format!("k_len {k_len} is shorter than q_len {q_len}"),
            });
        }

        let scores = q.contiguous()?.matmul(&k.t()?.contiguous()?)?;
        let scores = (scores * self.divisor as f64)?;
        let mask = build_causal_mask(q.device(), batch, heads, q_len, k_len)?;
        Ok(scores.add(&mask)?)
    }

    /// Attention probabilities `softmax(scores)`.
    pub fn probabilities(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        Ok(softmax_last_dim(&self.scores(q, k)?)?)
    }

    /// `softmax(QKᵀ · divisor + mask) V`; the last `q_len` keys align with the queries.
    pub fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let probs = self.probabilities(q, k)?;
        let (_, _, k_len, _) = k.dims4()?;
        let (_, _, v_len, _) = v.dims4()?;
        if v_len != k_len {
            return Err(AttentionError::InvalidShape {
                context: format!("v holds {v_len} positions but k holds {k_len}"),
            });
        }
        Ok(probs.matmul(&v.contiguous()?)?)
    }
}

/// Whole attention block (`x -> c_attn -> rope -> attend -> c_proj`) without fusion.
///
/// `x` is `[B, T, C]`, `c_attn` is `[C, 3C]`, `c_proj` is `[C, C]`.
pub fn block_forward(
    x: &Tensor,
    c_attn: &Tensor,
    c_proj: &Tensor,
    n_head: usize,
    rope: Option<&RotaryEmbedding>,
) -> Result<Tensor> {
    let (batch, seq, c) = x.dims3()?;
    if n_head == 0 || c % n_head != 0 {
        return Err(AttentionError::config(format!(
            "n_embd {c} is not divisible by n_head {n_head}"
        )));
    }
    let head_dim = c / n_head;

    let qkv = x.broadcast_matmul(c_attn)?.reshape((batch, seq, 3, n_head, head_dim))?;
    let split = |i: usize| -> Result<Tensor> {
        Ok(qkv.narrow(2, i, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()?)
    };
    let (mut q, mut k, v) = (split(0)?, split(1)?, split(2)?);
    if let Some(rope) = rope {
        q = rope.forward(&Operand::Plain(q), 0)?.0.to_plain()?;
        k = rope.forward(&Operand::Plain(k), 0)?.0.to_plain()?;
    }

    let y = ExactAttention::new(head_dim).attend(&q, &k, &v)?;
    let y = y.transpose(1, 2)?.contiguous()?.reshape((batch, seq, c))?;
    Ok(y.broadcast_matmul(c_proj)?)
}
