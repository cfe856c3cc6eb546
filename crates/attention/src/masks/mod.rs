//! Causal masking for attention scores.
//!
//! Additive masks produced here are `f32` tensors shaped
//! `[batch, num_heads, q_len, k_len]` holding `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard). Masked scores are exactly `-inf`, never a
//! large finite negative, so softmax assigns them exactly zero probability.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{
    attention_mask, build_causal_mask, is_masked, register_kernels, AttentionMask, MaskGrads, MaskSaved,
};
