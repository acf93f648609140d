//! Per-worker pin ledger over the chunk cache.
//!
//! A worker acquires every cell through its clipper. The first touch of a
//! key in a batch pins it in the cache and memoizes the handle; repeated
//! touches hit the local map only, which amortizes the cache index lock
//! across a whole batch. `clip()` releases everything in one pass, and
//! dropping the clipper clips, so a panicking batch still releases its
//! pins.

use crate::cache::{CellRef, ChunkCache};
use entile_core::{ChunkKey, Result};
use rustc_hash::FxHashMap;

pub struct Clipper<'a> {
    cache: &'a ChunkCache,
    pinned: FxHashMap<ChunkKey, CellRef>,
}

impl<'a> Clipper<'a> {
    pub fn new(cache: &'a ChunkCache) -> Self {
        Clipper {
            cache,
            pinned: FxHashMap::default(),
        }
    }

    /// The cell for `key`, pinned for the rest of the batch.
    pub fn acquire(&mut self, key: ChunkKey) -> Result<&CellRef> {
        use std::collections::hash_map::Entry;
        match self.pinned.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => Ok(v.insert(self.cache.acquire(key)?)),
        }
    }

    /// Number of distinct keys pinned this batch.
    pub fn pinned(&self) -> usize {
        self.pinned.len()
    }

    /// Release every pin taken since the last clip.
    pub fn clip(&mut self) {
        for key in self.pinned.keys() {
            self.cache.release(key);
        }
        self.pinned.clear();
    }
}

impl Drop for Clipper<'_> {
    fn drop(&mut self) {
        self.clip();
    }
}
