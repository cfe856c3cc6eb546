//! Configuration and error types shared across the attention crate.
//!
//! Tensors inside the block use the layout `[batch, n_heads, seq_len, head_dim]`
//! once heads are split; the public module boundary is `[batch, seq_len, n_embd]`.

pub mod config;
pub mod errors;

pub use config::{AttentionConfig, RopeSettings};
pub use errors::{AttentionError, Result};
