//! Memory-bounded LRU cache of decoded regions.
//!
//! Keys combine the source hash (xxh3 of the encoded bytes), the canonical
//! rotation, the oriented rectangle and the sample size, so a cache can be shared
//! between decoders and survives reopening the same image.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::PixelBuffer;
use super::rotation::Rotation;
use crate::geometry::Rect;

/// Default memory budget in megabytes.
pub const DEFAULT_TILE_CACHE_MB: usize = 128;

/// Minimum memory budget in megabytes.
const MIN_MEMORY_MB: usize = 16;

/// Maximum memory budget in megabytes.
const MAX_MEMORY_MB: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub source: u64,
    pub rotation: Rotation,
    pub rect: Rect,
    pub sample_size: u32,
}

struct CacheState {
    entries: LruCache<TileKey, Arc<PixelBuffer>>,
    current_bytes: usize,
}

/// Shared region cache. Clones share the same storage.
#[derive(Clone)]
pub struct TileCache {
    max_memory_bytes: usize,
    state: Arc<Mutex<CacheState>>,
}

impl TileCache {
    /// Create a cache with a budget of `max_memory_mb`, clamped to 16..=1024.
    pub fn new(max_memory_mb: usize) -> Self {
        let max_memory_mb = max_memory_mb.clamp(MIN_MEMORY_MB, MAX_MEMORY_MB);
        debug!(max_memory_mb, "Initialized tile cache");
        Self {
            max_memory_bytes: max_memory_mb * 1024 * 1024,
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            })),
        }
    }

    /// Look up a region, marking it most recently used.
    pub fn get(&self, key: &TileKey) -> Option<Arc<PixelBuffer>> {
        let mut state = self.state.lock();
        let hit = state.entries.get(key).cloned();
        trace!(hit = hit.is_some(), ?key.rect, key.sample_size, "Tile cache lookup");
        hit
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Insert a region, evicting least recently used entries to stay in budget.
    ///
    /// Regions larger than the whole budget are not cached.
    pub fn insert(&self, key: TileKey, buffer: Arc<PixelBuffer>) {
        let new_size = buffer.memory_bytes();
        if new_size > self.max_memory_bytes {
            trace!(bytes = new_size, "Region exceeds tile cache budget, skipping");
            return;
        }

        let mut state = self.state.lock();
        if let Some(old) = state.entries.pop(&key) {
            state.current_bytes = state.current_bytes.saturating_sub(old.memory_bytes());
        }

        while state.current_bytes + new_size > self.max_memory_bytes {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.current_bytes =
                        state.current_bytes.saturating_sub(evicted.memory_bytes());
                    trace!(
                        evicted_bytes = evicted.memory_bytes(),
                        current_bytes = state.current_bytes,
                        "Evicted region from tile cache"
                    );
                }
                None => break,
            }
        }

        state.entries.put(key, buffer);
        state.current_bytes += new_size;
    }

    pub fn remove(&self, key: &TileKey) -> bool {
        let mut state = self.state.lock();
        match state.entries.pop(key) {
            Some(evicted) => {
                state.current_bytes = state.current_bytes.saturating_sub(evicted.memory_bytes());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.current_bytes = 0;
        debug!("Cleared tile cache");
    }

    pub fn memory_usage(&self) -> usize {
        self.state.lock().current_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory_bytes
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_CACHE_MB)
    }
}
