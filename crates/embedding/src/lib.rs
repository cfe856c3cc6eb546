//! Embedding crate
//!
//! The positional module exposes rotary positional embeddings backed by a
//! shared, append-only angle cache.

pub mod positional;

pub use positional::rope::{register_kernels, register_kernels_with};
pub use positional::*;
