//! Append-then-trim key/value cache for one attention layer.

use kernels::Operand;

use super::layout::{CacheLayout, TIME_AXIS};
use crate::core::{AttentionError, Result};

/// Cached keys/values of one layer.
///
/// `length` counts retained positions and never exceeds the window;
/// `cumulative_length` counts every position ever appended and is the phase
/// offset for rotary embeddings.
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Operand,
    values: Operand,
    length: usize,
    cumulative_length: usize,
    layout: CacheLayout,
}

/// Result of merging a new chunk into a cache.
#[derive(Debug, Clone)]
pub struct KvUpdate {
    /// Keys the current chunk attends to: the trimmed window, or the whole
    /// chunk for a prefill longer than the window.
    pub keys: Operand,
    pub values: Operand,
    /// Positions in `keys` in front of the new chunk.
    pub past_len: usize,
    /// Cache to carry into the next step.
    pub present: KvCache,
}

impl KvCache {
    /// Merges `k_new`/`v_new` (`[B, H, T, D]`) into `past`.
    ///
    /// The returned `present` keeps the newest `min(past + T, max_seq_len)`
    /// positions and advances `cumulative_length` by `T`. The attended keys
    /// never span more than the window once a past exists, so a chunk longer
    /// than the window is only accepted as a prefill with no past.
    pub fn append(past: Option<KvCache>, k_new: &Operand, v_new: &Operand, max_seq_len: usize) -> Result<KvUpdate> {
        if k_new.dims() != v_new.dims() {
            return Err(AttentionError::InvalidShape {
                context: format!("kv slices disagree: k {:?} v {:?}", k_new.dims(), v_new.dims()),
            });
        }
        if k_new.is_packed() != v_new.is_packed() {
            return Err(AttentionError::Precision {
                message: "keys and values must share a representation".into(),
            });
        }
        let chunk = k_new.dims().get(TIME_AXIS).copied().unwrap_or(0);

        let (keys, values, past_len, previous_cumulative, layout) = match past {
            Some(past) => {
                past.layout.check_slice(k_new.dims())?;
                if past.layout.max_seq_len != max_seq_len {
                    return Err(AttentionError::usage(format!(
                        "cache window {} does not match requested window {max_seq_len}",
                        past.layout.max_seq_len
                    )));
                }
                if past.is_packed() != k_new.is_packed() {
                    return Err(AttentionError::Precision {
                        message: "cache and new slices must share a representation".into(),
                    });
                }
                if chunk > max_seq_len {
                    return Err(AttentionError::usage(format!(
                        "chunk of {chunk} positions exceeds the cache window {max_seq_len}"
                    )));
                }
                let keys = Operand::cat(&[&past.keys, k_new], TIME_AXIS)?;
                let values = Operand::cat(&[&past.values, v_new], TIME_AXIS)?;
                (keys, values, past.length, past.cumulative_length, past.layout)
            }
            None => {
                let layout = CacheLayout::of_slice(k_new.dims(), max_seq_len)?;
                log::info!(
                    "kv-cache init: batch={} heads={} head_dim={} max_seq_len={} packed={}",
                    layout.batch,
                    layout.num_heads,
                    layout.head_dim,
                    layout.max_seq_len,
                    k_new.is_packed()
                );
                (k_new.clone(), v_new.clone(), 0, 0, layout)
            }
        };

        let total = past_len + chunk;
        let (kept_keys, kept_values, length) = if total > max_seq_len {
            let start = total - max_seq_len;
            log::debug!("kv-cache trim: dropping {start} oldest positions (window {max_seq_len})");
            (
                keys.narrow(TIME_AXIS, start, max_seq_len)?,
                values.narrow(TIME_AXIS, start, max_seq_len)?,
                max_seq_len,
            )
        } else {
            (keys.clone(), values.clone(), total)
        };

        // Only a prefill longer than the window attends past its own trim.
        let (keys, values, past_len) = if chunk > max_seq_len {
            (keys, values, 0)
        } else {
            (kept_keys.clone(), kept_values.clone(), length - chunk)
        };
        let present = KvCache {
            keys: kept_keys,
            values: kept_values,
            length,
            cumulative_length: previous_cumulative + chunk,
            layout,
        };
        Ok(KvUpdate {
            keys,
            values,
            past_len,
            present,
        })
    }

    pub fn keys(&self) -> &Operand {
        &self.keys
    }

    pub fn values(&self) -> &Operand {
        &self.values
    }

    /// Retained positions.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Positions ever appended, including trimmed ones.
    pub fn cumulative_length(&self) -> usize {
        self.cumulative_length
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn is_packed(&self) -> bool {
        self.keys.is_packed()
    }
}
