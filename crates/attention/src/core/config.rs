//! Configuration for the causal self-attention block.
//!
//! Configs deserialize from JSON (missing fields fall back to [`Default`]) and
//! accept a small set of environment overrides layered on top:
//! - `ATTN_PACKED` (`1|true|0|false`) toggles the packed half-precision path.
//! - `ATTN_CHECKPOINT` toggles recomputation in the backward pass.
//! - `ATTN_DROPOUT` overrides `attn_dropout` (parsed as f32).
//! - `ROPE_THETA` overrides the rotary base (enables RoPE if it was off).
//! - `ROPE_ROTATE_DIM` overrides `rotate_dim` (`0` maps to the full head).

use embedding::positional::rope::{RopeConfig, DEFAULT_GROWTH_CHUNK, DEFAULT_THETA};
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Rotary embedding settings for an attention block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeSettings {
    pub theta: f32,
    pub rotate_dim: Option<usize>,
    pub growth_chunk: usize,
}

impl Default for RopeSettings {
    fn default() -> Self {
        Self {
            theta: DEFAULT_THETA,
            rotate_dim: None,
            growth_chunk: DEFAULT_GROWTH_CHUNK,
        }
    }
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Stable per-layer name used to key saved weights.
    pub name: String,
    /// Embedding width `C`.
    pub n_embd: usize,
    pub n_head: usize,
    /// Maximum context window retained by the KV cache.
    pub block_size: usize,
    /// Dropout applied to attention probabilities during training.
    pub attn_dropout: f32,
    /// Dropout applied to the projected output during training.
    pub resid_dropout: f32,
    /// `None` disables rotary embeddings (and therefore incremental decoding).
    pub rope: Option<RopeSettings>,
    /// Run projections and attention on packed half-precision operands.
    pub packed: bool,
    /// Keep only the input during training and recompute in `backward`.
    pub checkpoint: bool,
    /// Base seed for dropout masks.
    pub seed: u64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            name: "attn".to_string(),
            n_embd: 0,
            n_head: 1,
            block_size: 0,
            attn_dropout: 0.0,
            resid_dropout: 0.0,
            rope: Some(RopeSettings::default()),
            packed: false,
            checkpoint: false,
            seed: 0,
        }
    }
}

impl AttentionConfig {
    pub fn new(name: impl Into<String>, n_embd: usize, n_head: usize, block_size: usize) -> Self {
        Self {
            name: name.into(),
            n_embd,
            n_head,
            block_size,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| AttentionError::config(format!("invalid attention config json: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| AttentionError::config(format!("failed to encode attention config: {err}")))
    }

    pub fn head_dim(&self) -> usize {
        if self.n_head == 0 {
            0
        } else {
            self.n_embd / self.n_head
        }
    }

    pub fn rope_config(&self) -> Option<RopeConfig> {
        self.rope.as_ref().map(|rope| RopeConfig {
            head_dim: self.head_dim(),
            rope_theta: rope.theta,
            rotate_dim: rope.rotate_dim,
            growth_chunk: rope.growth_chunk,
        })
    }

    /// Validate structural invariants before any weights are allocated.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AttentionError::config("name must not be empty"));
        }
        if self.n_embd == 0 {
            return Err(AttentionError::config("n_embd must be greater than zero"));
        }
        if self.n_head == 0 {
            return Err(AttentionError::config("n_head must be greater than zero"));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(AttentionError::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.block_size == 0 {
            return Err(AttentionError::config("block_size must be greater than zero"));
        }
        for (label, p) in [("attn_dropout", self.attn_dropout), ("resid_dropout", self.resid_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::config(format!("{label} must be in [0, 1), got {p}")));
            }
        }
        if self.packed && self.head_dim() % 2 != 0 {
            return Err(AttentionError::config(format!(
                "packed attention needs an even head_dim, got {}",
                self.head_dim()
            )));
        }
        if let Some(rope) = self.rope_config() {
            rope.validate()?;
        }
        Ok(())
    }

    /// Layer `ATTN_*`/`ROPE_*` environment variables over the current values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`AttentionConfig::apply_env_overrides`] with an explicit lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ATTN_PACKED").and_then(|v| parse_flag("ATTN_PACKED", &v)) {
            self.packed = value;
        }
        if let Some(value) = lookup("ATTN_CHECKPOINT").and_then(|v| parse_flag("ATTN_CHECKPOINT", &v)) {
            self.checkpoint = value;
        }
        if let Some(raw) = lookup("ATTN_DROPOUT") {
            match raw.trim().parse::<f32>() {
                Ok(p) => self.attn_dropout = p,
                Err(_) => log::warn!("ignoring ATTN_DROPOUT={raw:?}: not a number"),
            }
        }
        if let Some(raw) = lookup("ROPE_THETA") {
            match raw.trim().parse::<f32>() {
                Ok(theta) => self.rope.get_or_insert_with(RopeSettings::default).theta = theta,
                Err(_) => log::warn!("ignoring ROPE_THETA={raw:?}: not a number"),
            }
        }
        if let Some(raw) = lookup("ROPE_ROTATE_DIM") {
            match raw.trim().parse::<usize>() {
                Ok(dim) => {
                    self.rope.get_or_insert_with(RopeSettings::default).rotate_dim =
                        if dim == 0 { None } else { Some(dim) };
                }
                Err(_) => log::warn!("ignoring ROPE_ROTATE_DIM={raw:?}: not an integer"),
            }
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("ignoring {key}={raw:?}: expected a boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fills_missing_fields_from_defaults() -> Result<()> {
        let config = AttentionConfig::from_json_str(r#"{"n_embd": 16, "n_head": 2, "block_size": 4}"#)?;
        assert_eq!(config.name, "attn");
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.rope, Some(RopeSettings::default()));
        let round = AttentionConfig::from_json_str(&config.to_json_string()?)?;
        assert_eq!(round, config);
        Ok(())
    }

    #[test]
    fn odd_rotary_dim_is_rejected() {
        let mut config = AttentionConfig::new("h0", 16, 2, 4);
        config.rope = Some(RopeSettings {
            rotate_dim: Some(3),
            ..RopeSettings::default()
        });
        assert!(matches!(config.validate(), Err(AttentionError::Config { .. })));
    }

    #[test]
    fn overrides_are_layered_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("ATTN_PACKED", "true"),
            ("ATTN_CHECKPOINT", "maybe"),
            ("ATTN_DROPOUT", "0.25"),
            ("ROPE_ROTATE_DIM", "4"),
        ]
        .into_iter()
        .collect();
        let mut config = AttentionConfig::new("h0", 16, 2, 4);
        config.rope = None;
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert!(config.packed);
        assert!(!config.checkpoint);
        assert_eq!(config.attn_dropout, 0.25);
        assert_eq!(config.rope.as_ref().and_then(|r| r.rotate_dim), Some(4));
    }
}
