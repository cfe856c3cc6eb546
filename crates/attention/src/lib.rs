//! Causal self-attention for the transformer project.
//!
//! The public boundary is [`CausalSelfAttention`], which consumes `[batch,
//! seq_len, n_embd]` activations and, when decoding, the [`KvCache`] returned by
//! its previous call. Internally heads use the layout `[batch, n_heads,
//! seq_len, head_dim]`.
//!
//! Every numeric step runs through the kernels of the `kernels` and `embedding`
//! crates, either on plain `f32` tensors or on packed half-precision pairs
//! ([`Operand`]). Causal masking is always enforced: masked scores are `-inf`
//! and receive exactly zero probability.
//!
//! Dropout is a train-only concern. Inference calls are deterministic.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod module;
pub mod reference;

pub use core::{AttentionConfig, AttentionError, Result, RopeSettings};
pub use kernels::registry::{Backend, KernelRegistry};
pub use kernels::Operand;
pub use kv_cache::{CacheLayout, DecodeSession, KvCache, KvUpdate};
pub use masks::AttentionMask;
pub use module::{AttentionGrads, AttentionOutput, AttentionTape, CallOptions, CausalSelfAttention};
pub use reference::ExactAttention;

/// Registers the attention-specific kernels (`AttentionMask`).
pub fn register_kernels(registry: &mut KernelRegistry) -> Result<()> {
    masks::register_kernels(registry)?;
    Ok(())
}

/// Registry holding every kernel the attention block depends on.
pub fn full_registry() -> Result<KernelRegistry> {
    let mut registry = KernelRegistry::new();
    kernels::registry::register_kernels(&mut registry)?;
    embedding::register_kernels(&mut registry)?;
    register_kernels(&mut registry)?;
    log::debug!("kernel registry ready: {:?}", registry.names(Backend::Cpu));
    Ok(registry)
}
