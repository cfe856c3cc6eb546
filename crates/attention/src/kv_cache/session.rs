//! Per-generation ownership of layer caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::cache::KvCache;
use crate::core::{AttentionError, Result};

/// One cache slot per layer plus the "still active" flag.
///
/// Concurrent generations each need their own session. The stop handle may be
/// shared with another thread; the decoding loop observes it between tokens.
#[derive(Debug)]
pub struct DecodeSession {
    layers: Vec<Option<KvCache>>,
    active: Arc<AtomicBool>,
    steps: usize,
}

impl DecodeSession {
    pub fn new(num_layers: usize) -> Self {
        log::info!("decode session start: layers={num_layers}");
        Self {
            layers: vec![None; num_layers],
            active: Arc::new(AtomicBool::new(true)),
            steps: 0,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flag another thread can clear to stop generation early.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Stops generation and releases every cached buffer.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.layers.iter_mut().for_each(|slot| *slot = None);
    }

    /// Drops all caches and re-arms the session for a new prompt.
    pub fn reset(&mut self) {
        log::debug!("decode session reset after {} steps", self.steps);
        self.layers.iter_mut().for_each(|slot| *slot = None);
        self.steps = 0;
        self.active.store(true, Ordering::Release);
    }

    fn slot(&mut self, layer: usize) -> Result<&mut Option<KvCache>> {
        let count = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or_else(|| AttentionError::usage(format!("layer {layer} out of range for {count} layers")))
    }

    /// Moves a layer's cache out for the next attention call.
    pub fn take(&mut self, layer: usize) -> Result<Option<KvCache>> {
        if !self.is_active() {
            return Err(AttentionError::usage("decode session has been stopped"));
        }
        Ok(self.slot(layer)?.take())
    }

    /// Stores the cache returned by an attention call.
    pub fn store(&mut self, layer: usize, cache: Option<KvCache>) -> Result<()> {
        if !self.is_active() {
            return Err(AttentionError::usage("decode session has been stopped"));
        }
        *self.slot(layer)? = cache;
        Ok(())
    }

    pub fn cache(&self, layer: usize) -> Option<&KvCache> {
        self.layers.get(layer).and_then(Option::as_ref)
    }

    /// Logical tokens processed so far (from the first layer's cache).
    pub fn cumulative_length(&self) -> usize {
        self.cache(0).map(KvCache::cumulative_length).unwrap_or(0)
    }

    pub fn finish_step(&mut self) {
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}
