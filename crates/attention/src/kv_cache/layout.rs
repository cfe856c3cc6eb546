//! Layout definitions for key/value caches.
//!
//! Cached tensors are ordered `[batch, heads, positions, head_dim]`; the
//! position axis is the one appended to and trimmed.

use crate::core::{AttentionError, Result};

/// Position axis of cached tensors.
pub const TIME_AXIS: usize = 2;

/// Declarative description of a cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    /// Number of attention heads stored in the cache.
    pub num_heads: usize,
    /// Maximum number of positions retained (the context window).
    pub max_seq_len: usize,
    /// Dimensionality of each head.
    pub head_dim: usize,
}

impl CacheLayout {
    /// Layout of a `[batch, heads, seq, head_dim]` slice under a window.
    pub fn of_slice(dims: &[usize], max_seq_len: usize) -> Result<Self> {
        match dims {
            [batch, num_heads, _, head_dim] => {
                if max_seq_len == 0 {
                    return Err(AttentionError::config("cache window must be non-zero"));
                }
                Ok(Self {
                    batch: *batch,
                    num_heads: *num_heads,
                    max_seq_len,
                    head_dim: *head_dim,
                })
            }
            _ => Err(AttentionError::InvalidShape {
                context: format!("kv slice must be [batch, heads, seq, head_dim], got {dims:?}"),
            }),
        }
    }

    /// Checks that a slice can be appended to a cache with this layout.
    pub fn check_slice(&self, dims: &[usize]) -> Result<()> {
        let other = Self::of_slice(dims, self.max_seq_len)?;
        if other != *self {
            return Err(AttentionError::usage(format!(
                "kv slice {dims:?} does not match cache layout [{}, {}, *, {}]",
                self.batch, self.num_heads, self.head_dim
            )));
        }
        Ok(())
    }
}
