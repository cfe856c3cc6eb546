//! Deterministic dropout masks.
//!
//! Masks are drawn from a seeded linear congruential generator so a
//! checkpointed recomputation of a forward pass reproduces exactly the mask the
//! original pass used.

use crate::{KernelError, Result};

/// Dropout request carried by fused kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutSpec {
    /// Probability of zeroing an element, in `[0, 1)`.
    pub probability: f32,
    /// Seed for the mask generator.
    pub seed: u64,
}

impl DropoutSpec {
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(KernelError::Config(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self { probability, seed })
    }

    /// Keep-mask already scaled by `1 / (1 - p)` so kept entries preserve the
    /// expected value.
    pub fn scaled_mask(&self, len: usize) -> Vec<f32> {
        let keep = 1.0 - self.probability;
        let scale = 1.0 / keep;
        let mut rng = Lcg64::new(self.seed);
        (0..len)
            .map(|_| if rng.next_f32() < keep { scale } else { 0.0 })
            .collect()
    }
}

/// Applies an optional dropout request to host values, returning the mask used.
pub fn apply(values: &mut [f32], spec: Option<&DropoutSpec>) -> Option<Vec<f32>> {
    let spec = spec.filter(|s| s.probability > 0.0)?;
    let mask = spec.scaled_mask(values.len());
    for (value, m) in values.iter_mut().zip(&mask) {
        *value *= m;
    }
    Some(mask)
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        // Parameters from Numerical Recipes.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
