//! Key/value caching for incremental decoding.
//!
//! A [`KvCache`] holds one layer's projected keys and values with layout
//! `[batch, heads, positions, head_dim]`. Each decoding step consumes the
//! previous cache and returns the updated one, so a cache is only ever owned by
//! one session. [`DecodeSession`] keeps one slot per layer plus the flag the
//! generation loop checks between tokens.

pub mod cache;
pub mod layout;
pub mod session;

pub use cache::{KvCache, KvUpdate};
pub use layout::CacheLayout;
pub use session::DecodeSession;
