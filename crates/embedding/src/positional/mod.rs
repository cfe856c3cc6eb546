//! Positional encodings applied to attention queries and keys.

pub mod rope;

pub use rope::{RopeCache, RopeCachePool, RopeConfig, RopeSaved, RopeTables, RotaryEmbedding};
