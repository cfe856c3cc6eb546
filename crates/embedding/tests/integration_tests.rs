//! Integration smoke tests for the embedding crate.

use embedding::positional::rope::{RopeConfig, DEFAULT_GROWTH_CHUNK};

#[test]
fn positional_module_exposes_defaults() {
    let config = RopeConfig::default();
    assert_eq!(config.head_dim, 0);
    assert_eq!(config.rope_theta, 10_000.0);
    assert_eq!(config.rotate_dim, None);
    assert_eq!(config.growth_chunk, DEFAULT_GROWTH_CHUNK);
    assert!(config.validate().is_err());
}

#[test]
fn inverse_frequencies_follow_the_theta_schedule() {
    let config = RopeConfig::new(8);
    let inv = config.inv_freqs();
    assert_eq!(inv.len(), 4);
    assert_eq!(inv[0], 1.0);
    assert!((inv[1] - 10_000f64.powf(-0.25)).abs() < 1e-12);
    assert!(inv.windows(2).all(|w| w[1] < w[0]));
}
