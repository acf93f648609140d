//! Pin-counted cache of resident cells with write-back eviction.
//!
//! The residency index is guarded by one mutex with strictly O(1) lock
//! scope; each slot carries its own lock for the cell body, so loading a
//! chunk never blocks the index and at most one load is in flight per key
//! (concurrent acquirers block on the slot lock until the first one has
//! materialized the cell).
//!
//! Unpinned cells sit on a least-recently-released list. Eviction writes
//! the victim through the store *before* unmapping it, so a concurrent
//! re-acquire either finds it still resident (and keeps the now-clean
//! cell) or reloads the freshly persisted chunk. A cell with points is
//! therefore always resident or persisted, and chunk writes only ever
//! grow within one build.

use crate::cell::{Cell, CellKind};
use crate::store::ChunkStore;
use entile_core::{ChunkKey, Result};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;

/// Sizing and shaping knobs the cache needs from the build.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Per-cell point capacity.
    pub chunk_capacity: usize,
    /// Depths shallower than this get base cells.
    pub base_depth_end: u32,
    /// Soft cap on resident cells.
    pub soft_cap: usize,
    /// Consult the store on any miss. Enabled for resumed builds; a fresh
    /// build ignores whatever chunks may already sit at the prefix and
    /// only reloads cells it evicted itself.
    pub load_existing: bool,
}

#[derive(Debug)]
struct Slot {
    key: ChunkKey,
    cell: Mutex<Option<Cell>>,
}

struct Entry {
    slot: Arc<Slot>,
    pins: u32,
    /// Ticket on the inactive list; `None` while pinned or mid-eviction.
    inactive_seq: Option<u64>,
}

struct CacheState {
    entries: FxHashMap<ChunkKey, Entry>,
    /// Front = most recently released. Stale tickets are skipped lazily.
    inactive: VecDeque<(u64, ChunkKey)>,
    next_seq: u64,
    /// Keys this build has written and unmapped; a miss on one of these
    /// must reload from the store even when `load_existing` is off.
    evicted: FxHashSet<ChunkKey>,
}

/// Pinned handle to a resident cell. Does not release on drop; the
/// clipper owns release so a whole batch unpins in one pass.
#[derive(Clone)]
pub struct CellRef {
    slot: Arc<Slot>,
}

impl CellRef {
    pub fn key(&self) -> ChunkKey {
        self.slot.key
    }

    /// Run `f` under the cell's lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Cell) -> R) -> R {
        let mut guard = self.slot.cell.lock();
        f(guard.as_mut().expect("acquired cell is materialized"))
    }
}

/// LRU of materialized cells keyed by `ChunkKey`.
pub struct ChunkCache {
    store: ChunkStore,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ChunkCache {
    pub fn new(store: ChunkStore, config: CacheConfig) -> Self {
        ChunkCache {
            store,
            config,
            state: Mutex::new(CacheState {
                entries: FxHashMap::default(),
                inactive: VecDeque::new(),
                next_seq: 0,
                evicted: FxHashSet::default(),
            }),
        }
    }

    fn kind_for(&self, key: &ChunkKey) -> CellKind {
        if key.depth() < self.config.base_depth_end {
            CellKind::Base
        } else {
            CellKind::Overflow
        }
    }

    /// Pin and return the cell for `key`, materializing it if needed.
    pub fn acquire(&self, key: ChunkKey) -> Result<CellRef> {
        let (slot, consult_store) = {
            let mut state = self.state.lock();
            let consult_store = self.config.load_existing || state.evicted.contains(&key);
            let entry = state.entries.entry(key).or_insert_with(|| Entry {
                slot: Arc::new(Slot {
                    key,
                    cell: Mutex::new(None),
                }),
                pins: 0,
                inactive_seq: None,
            });
            entry.pins += 1;
            entry.inactive_seq = None;
            (Arc::clone(&entry.slot), consult_store)
        };

        // Materialize under the slot lock; later acquirers of the same key
        // block here until the first load completes.
        {
            let mut guard = slot.cell.lock();
            if guard.is_none() {
                let kind = self.kind_for(&key);
                let capacity = self.config.chunk_capacity;
                let loaded = if consult_store {
                    self.store.load_cell(&key, kind, capacity)
                } else {
                    Ok(Cell::new(key, kind, capacity))
                };
                match loaded {
                    Ok(cell) => *guard = Some(cell),
                    Err(e) => {
                        drop(guard);
                        self.unwind_failed_acquire(&key);
                        return Err(e);
                    }
                }
            }
        }

        Ok(CellRef { slot })
    }

    /// Undo the pin taken by a failed acquire and drop the empty slot if
    /// nobody else holds it.
    fn unwind_failed_acquire(&self, key: &ChunkKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.pins -= 1;
            if entry.pins == 0 && entry.slot.cell.lock().is_none() {
                state.entries.remove(key);
            }
        }
    }

    /// Unpin `key`. At pin count zero the cell becomes eligible for
    /// eviction, ordered by release recency.
    pub fn release(&self, key: &ChunkKey) {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(key)
            .expect("release of a key that is not resident");
        debug_assert!(entry.pins > 0);
        entry.pins -= 1;
        if entry.pins == 0 {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.get_mut(key).unwrap().inactive_seq = Some(seq);
            state.inactive.push_front((seq, *key));
        }
    }

    /// Evict least-recently-released unpinned cells until the resident
    /// count is back under the soft cap. Dirty victims are written through
    /// before they are unmapped.
    pub fn maybe_evict(&self) -> Result<()> {
        loop {
            let (key, slot) = {
                let mut state = self.state.lock();
                if state.entries.len() <= self.config.soft_cap {
                    return Ok(());
                }
                match pop_candidate(&mut state) {
                    Some(found) => found,
                    // Everything over the cap is pinned right now.
                    None => return Ok(()),
                }
            };

            {
                let mut guard = slot.cell.lock();
                if let Some(cell) = guard.as_mut() {
                    if cell.is_dirty() && !cell.is_empty() {
                        self.store.write(cell)?;
                        cell.mark_clean();
                    }
                }
            }

            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get(&key) {
                // A concurrent acquire may have re-pinned (or re-released)
                // the cell while we wrote it; it stays resident then.
                if entry.pins == 0 && entry.inactive_seq.is_none() {
                    state.entries.remove(&key);
                    state.evicted.insert(key);
                }
            }
        }
    }

    /// Write every dirty resident cell through to the store. Called at
    /// the end of a build and on cancellation drain.
    pub fn flush(&self) -> Result<()> {
        let slots: Vec<Arc<Slot>> = {
            let state = self.state.lock();
            state.entries.values().map(|e| Arc::clone(&e.slot)).collect()
        };
        for slot in slots {
            let mut guard = slot.cell.lock();
            if let Some(cell) = guard.as_mut() {
                if cell.is_dirty() && !cell.is_empty() {
                    self.store.write(cell)?;
                    cell.mark_clean();
                }
            }
        }
        Ok(())
    }

    /// Number of resident cells.
    pub fn resident(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Pop the least-recently-released unpinned key, skipping stale tickets.
/// The winner's ticket is cleared so no second evictor can pick it.
fn pop_candidate(state: &mut CacheState) -> Option<(ChunkKey, Arc<Slot>)> {
    while let Some((seq, key)) = state.inactive.pop_back() {
        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.pins == 0 && entry.inactive_seq == Some(seq) {
                entry.inactive_seq = None;
                return Some((key, Arc::clone(&entry.slot)));
            }
        }
    }
    None
}
