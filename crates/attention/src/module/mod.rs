//! Attention blocks assembled from the fused kernels.

pub mod self_attention;

pub use self_attention::{
    AttentionGrads, AttentionOutput, AttentionTape, CallOptions, CausalSelfAttention, DropoutSeeds,
};
