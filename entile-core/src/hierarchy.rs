//! The sparse hierarchy: per-node point counts and their block layout.
//!
//! During a build the hierarchy is a sharded concurrent map so workers can
//! increment counts without a global lock. At flush time it is partitioned
//! into blocks by `hierarchy_step`: keys at `depth < step` land in the
//! root block, and a deeper key lands in the block rooted at its ancestor
//! at depth `(depth / step) * step`. Each block serializes as a JSON
//! object of `"d-x-y-z": count` with sorted keys, so identical hierarchies
//! always produce identical bytes.

use crate::error::{Error, Result};
use crate::key::ChunkKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Default number of shards; plenty for a worker pool sized to hardware
/// concurrency.
const SHARD_COUNT: usize = 64;

/// Sharded concurrent map from `ChunkKey` to point count.
#[derive(Debug)]
pub struct Hierarchy {
    shards: Vec<Mutex<FxHashMap<ChunkKey, u64>>>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy {
    pub fn new() -> Self {
        Hierarchy {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, key: &ChunkKey) -> &Mutex<FxHashMap<ChunkKey, u64>> {
        // Low position bits spread adjacent cells across shards.
        let h = key.x() ^ key.y().rotate_left(21) ^ key.z().rotate_left(42) ^ key.depth() as u64;
        &self.shards[(h as usize) % SHARD_COUNT]
    }

    /// Add `count` points to `key`'s entry.
    pub fn increment(&self, key: ChunkKey, count: u64) {
        *self.shard(&key).lock().entry(key).or_insert(0) += count;
    }

    /// Remove `count` points from `key`'s entry, dropping it at zero so
    /// only non-empty nodes remain. Used when a base cell drains its
    /// overflow region and the drained points move to deeper cells.
    pub fn decrement(&self, key: ChunkKey, count: u64) {
        let mut shard = self.shard(&key).lock();
        let entry = shard.get_mut(&key).expect("decrement of an absent hierarchy entry");
        debug_assert!(*entry >= count);
        *entry -= count;
        if *entry == 0 {
            shard.remove(&key);
        }
    }

    /// Insert an entry that must not already exist. Used by the merger,
    /// where a second claim on a key means two shards built the same cell.
    pub fn insert_new(&self, key: ChunkKey, count: u64) -> Result<()> {
        let mut shard = self.shard(&key).lock();
        if shard.contains_key(&key) {
            return Err(Error::merge_collision(format!(
                "chunk key {} claimed twice",
                key
            )));
        }
        shard.insert(key, count);
        Ok(())
    }

    /// Number of non-empty nodes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Sum of all per-node counts.
    pub fn total_points(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().values().sum::<u64>())
            .sum()
    }

    /// Count at one key, if present.
    pub fn get(&self, key: &ChunkKey) -> Option<u64> {
        self.shard(key).lock().get(key).copied()
    }

    /// Sorted snapshot of every entry.
    pub fn entries(&self) -> BTreeMap<ChunkKey, u64> {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            for (k, v) in shard.lock().iter() {
                out.insert(*k, *v);
            }
        }
        out
    }

    /// Partition the hierarchy into blocks. Only non-empty partitions
    /// appear; entry keys inside a block are canonical `d-x-y-z` strings.
    pub fn to_blocks(&self, step: u32) -> BTreeMap<ChunkKey, BTreeMap<String, u64>> {
        let mut blocks: BTreeMap<ChunkKey, BTreeMap<String, u64>> = BTreeMap::new();
        for (key, count) in self.entries() {
            blocks
                .entry(block_root(key, step))
                .or_default()
                .insert(key.to_string(), count);
        }
        blocks
    }
}

/// The block a key belongs to: its ancestor at the nearest step boundary
/// at or above it (the root block for `depth < step`).
pub fn block_root(key: ChunkKey, step: u32) -> ChunkKey {
    debug_assert!(step > 0);
    key.ancestor_at(key.depth() / step * step)
}

/// Serialize one block to its JSON bytes.
pub fn block_to_json(entries: &BTreeMap<String, u64>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(entries)?)
}

/// Parse one block from JSON, returning typed keys.
pub fn block_from_json(bytes: &[u8]) -> Result<Vec<(ChunkKey, u64)>> {
    let raw: BTreeMap<String, u64> = serde_json::from_slice(bytes)?;
    raw.into_iter()
        .map(|(k, v)| Ok((k.parse::<ChunkKey>()?, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_and_total() {
        let h = Hierarchy::new();
        let root = ChunkKey::ROOT;
        h.increment(root, 3);
        h.increment(root, 2);
        h.increment(root.child(5), 1);
        assert_eq!(h.get(&root), Some(5));
        assert_eq!(h.get(&root.child(5)), Some(1));
        assert_eq!(h.get(&root.child(1)), None);
        assert_eq!(h.len(), 2);
        assert_eq!(h.total_points(), 6);
    }

    #[test]
    fn test_concurrent_increments() {
        let h = Arc::new(Hierarchy::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                let h = Arc::clone(&h);
                s.spawn(move || {
                    for i in 0..1000u64 {
                        let key = ChunkKey::ROOT.child((i % 8) as u8);
                        h.increment(key, 1);
                    }
                });
            }
        });
        assert_eq!(h.total_points(), 4000);
        assert_eq!(h.len(), 8);
        for octant in 0..8u8 {
            assert_eq!(h.get(&ChunkKey::ROOT.child(octant)), Some(500));
        }
    }

    #[test]
    fn test_decrement_drops_empty_entries() {
        let h = Hierarchy::new();
        let key = ChunkKey::ROOT.child(2);
        h.increment(key, 8);
        h.decrement(key, 3);
        assert_eq!(h.get(&key), Some(5));
        h.decrement(key, 5);
        assert_eq!(h.get(&key), None);
        assert!(h.is_empty());
    }

    #[test]
    fn test_insert_new_detects_collision() {
        let h = Hierarchy::new();
        let key = ChunkKey::new(2, 1, 1, 0);
        h.insert_new(key, 10).unwrap();
        assert!(matches!(
            h.insert_new(key, 4),
            Err(Error::MergeCollision(_))
        ));
    }

    #[test]
    fn test_block_root() {
        let step = 6;
        assert_eq!(block_root(ChunkKey::ROOT, step), ChunkKey::ROOT);
        // Depths 1..5 stay in the root block.
        let k5 = ChunkKey::ROOT.child(7).child(7).child(7).child(7).child(7);
        assert_eq!(k5.depth(), 5);
        assert_eq!(block_root(k5, step), ChunkKey::ROOT);
        // A depth-6 key roots its own block.
        let k6 = k5.child(0);
        assert_eq!(block_root(k6, step), k6);
        // Depth 7 joins its depth-6 ancestor's block.
        let k7 = k6.child(3);
        assert_eq!(block_root(k7, step), k6);
        // Depth 12 roots its own block again.
        let mut k12 = k7;
        for _ in 0..5 {
            k12 = k12.child(0);
        }
        assert_eq!(k12.depth(), 12);
        assert_eq!(block_root(k12, step), k12);
    }

    #[test]
    fn test_to_blocks_partitions() {
        let h = Hierarchy::new();
        let step = 2;
        let root = ChunkKey::ROOT;
        let d1 = root.child(1);
        let d2 = d1.child(0); // depth 2: own block
        let d3 = d2.child(4); // depth 3: joins d2's block
        h.increment(root, 4);
        h.increment(d1, 8);
        h.increment(d2, 15);
        h.increment(d3, 16);

        let blocks = h.to_blocks(step);
        assert_eq!(blocks.len(), 2);
        let root_block = &blocks[&root];
        assert_eq!(root_block.len(), 2);
        assert_eq!(root_block[&root.to_string()], 4);
        assert_eq!(root_block[&d1.to_string()], 8);
        let sub_block = &blocks[&d2];
        assert_eq!(sub_block.len(), 2);
        assert_eq!(sub_block[&d3.to_string()], 16);
    }

    #[test]
    fn test_block_json_roundtrip_and_determinism() {
        let h = Hierarchy::new();
        h.increment(ChunkKey::ROOT, 1);
        h.increment(ChunkKey::ROOT.child(3), 7);
        let blocks = h.to_blocks(6);
        let bytes = block_to_json(&blocks[&ChunkKey::ROOT]).unwrap();
        let parsed = block_from_json(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&(ChunkKey::ROOT, 1)));
        assert!(parsed.contains(&(ChunkKey::ROOT.child(3), 7)));
        // Same content serializes to identical bytes.
        assert_eq!(bytes, block_to_json(&blocks[&ChunkKey::ROOT]).unwrap());
    }
}
