//! Stitching completed subset builds into one logical tree.
//!
//! Each shard owns a disjoint set of chunk keys (its spans), so merging
//! is rename-and-concatenate: verify the shard manifests agree, fold
//! every shard hierarchy into one map — a key claimed twice is a
//! `MergeCollision` — copy each chunk to its unpostfixed name, then write
//! the unified hierarchy blocks and manifest.
//!
//! The merge is idempotent: per-shard markers let a re-run skip completed
//! chunk copies, and every written object is byte-deterministic, so
//! running it twice yields identical output. A partially failed merge is
//! recovered by simply running it again.

use crate::store::RetryPolicy;
use entile_core::hierarchy::{block_from_json, block_to_json, Hierarchy};
use entile_core::manifest::layout;
use entile_core::{join_key, ChunkKey, Endpoint, Error, Manifest, Result, Source};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-shard completion marker written after its chunks are copied.
#[derive(Debug, Serialize, Deserialize)]
struct MergedMarker {
    id: u64,
    chunks: u64,
}

/// What a merge produced.
#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub points: u64,
    pub chunks: usize,
    pub shards: u64,
    /// Shards whose chunk copies were already marked complete.
    pub already_merged: Vec<u64>,
}

/// Merges `of` completed subset builds under one prefix.
pub struct Merger {
    endpoint: Arc<dyn Endpoint>,
    prefix: String,
    of: u64,
    retry: RetryPolicy,
}

impl Merger {
    pub fn new(endpoint: Arc<dyn Endpoint>, prefix: impl Into<String>, of: u64) -> Result<Self> {
        if of == 0 || !of.is_power_of_two() || of.trailing_zeros() % 2 != 0 {
            return Err(Error::invalid_input(format!(
                "merge 'of' must be a power of four, got {}",
                of
            )));
        }
        Ok(Merger {
            endpoint,
            prefix: prefix.into(),
            of,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the merge across all shards and write the unified outputs.
    pub fn merge(&self) -> Result<MergeSummary> {
        let _span = tracing::info_span!("merge", of = self.of).entered();

        let hierarchy = Hierarchy::new();
        let mut base: Option<Manifest> = None;
        let mut sources: Vec<Source> = Vec::new();
        let mut duplicate_points = 0u64;
        let mut already_merged = Vec::new();

        for id in 1..=self.of {
            let shard = self.load_shard(id, base.as_ref())?;
            let keys = self.fold_shard_hierarchy(id, &shard, &hierarchy)?;

            let marker_key = join_key(&self.prefix, &layout::merged_marker(id));
            if self.endpoint.exists(&marker_key)? {
                tracing::info!(shard = id, "chunk copies already marked complete");
                already_merged.push(id);
            } else {
                self.copy_shard_chunks(id, &shard, &keys)?;
                let marker = MergedMarker {
                    id,
                    chunks: keys.len() as u64,
                };
                self.endpoint
                    .put(&marker_key, &serde_json::to_vec_pretty(&marker)?)?;
            }

            duplicate_points += shard.duplicate_points;
            if base.is_none() {
                sources = shard.sources.clone();
                base = Some(shard);
            }
        }

        let base = base.expect("of >= 1 shards were loaded");
        self.write_unified(&base, &hierarchy, sources, duplicate_points)?;

        let summary = MergeSummary {
            points: hierarchy.total_points(),
            chunks: hierarchy.len(),
            shards: self.of,
            already_merged,
        };
        tracing::info!(points = summary.points, chunks = summary.chunks, "merge complete");
        Ok(summary)
    }

    /// Load one shard manifest and verify it belongs to this merge.
    fn load_shard(&self, id: u64, base: Option<&Manifest>) -> Result<Manifest> {
        let postfix = format!("-{}", id);
        let manifest = Manifest::load(self.endpoint.as_ref(), &self.prefix, &postfix)?
            .ok_or_else(|| {
                Error::invalid_input(format!("shard {} has no manifest at this prefix", id))
            })?;
        let subset = manifest.subset.ok_or_else(|| {
            Error::invalid_input(format!("shard {} manifest carries no subset descriptor", id))
        })?;
        if subset.id() != id || subset.of() != self.of {
            return Err(Error::invalid_input(format!(
                "shard manifest claims subset {}/{}, expected {}/{}",
                subset.id(),
                subset.of(),
                id,
                self.of
            )));
        }
        if let Some(base) = base {
            if manifest.bounds != base.bounds
                || manifest.schema != base.schema
                || manifest.span != base.span
                || manifest.chunk_capacity != base.chunk_capacity
                || manifest.hierarchy_step != base.hierarchy_step
                || manifest.data_type != base.data_type
            {
                return Err(Error::invalid_input(format!(
                    "shard {} disagrees with shard 1 on build parameters",
                    id
                )));
            }
        }
        Ok(manifest)
    }

    /// Read one shard's hierarchy blocks into the global map, returning
    /// the shard's chunk keys.
    fn fold_shard_hierarchy(
        &self,
        id: u64,
        shard: &Manifest,
        hierarchy: &Hierarchy,
    ) -> Result<Vec<ChunkKey>> {
        let subset = shard
            .subset
            .expect("verified by load_shard")
            .resolve(&shard.bounds)?;
        let dir = join_key(&self.prefix, layout::HIERARCHY_DIR);
        let mut keys = Vec::new();
        for object in self.endpoint.list(&format!("{}/", dir))? {
            let name = object.rsplit('/').next().unwrap_or(&object);
            let Some((_root, Some(block_id))) = layout::parse_hierarchy_block(name) else {
                continue;
            };
            if block_id != id {
                continue;
            }
            let bytes = self.retry.run(&object, || self.endpoint.get(&object))?;
            for (key, count) in block_from_json(&bytes)? {
                if !subset.owns(&key) {
                    return Err(Error::invalid_input(format!(
                        "shard {} emitted chunk key {} outside its spans",
                        id, key
                    )));
                }
                hierarchy.insert_new(key, count)?;
                keys.push(key);
            }
        }
        tracing::info!(shard = id, chunks = keys.len(), "shard hierarchy folded");
        Ok(keys)
    }

    /// Copy every shard chunk to its unpostfixed name.
    fn copy_shard_chunks(&self, id: u64, shard: &Manifest, keys: &[ChunkKey]) -> Result<()> {
        let postfix = format!("-{}", id);
        let ext = shard.data_type.extension();
        for key in keys {
            let src = join_key(&self.prefix, &layout::chunk(key, &postfix, ext));
            let dst = join_key(&self.prefix, &layout::chunk(key, "", ext));
            self.retry.run(&src, || self.endpoint.copy(&src, &dst))?;
        }
        tracing::info!(shard = id, chunks = keys.len(), "shard chunks copied");
        Ok(())
    }

    /// Write the unified hierarchy blocks and manifest.
    ///
    /// Counters: every shard consumes all inputs, so `invalid` (and the
    /// out-of-global-bounds population) is counted identically by each
    /// shard, while inserts and duplicates partition by shard column. The
    /// merged out-of-bounds count falls out of conservation against the
    /// consumed total.
    fn write_unified(
        &self,
        base: &Manifest,
        hierarchy: &Hierarchy,
        sources: Vec<Source>,
        duplicate_points: u64,
    ) -> Result<()> {
        for (root, entries) in hierarchy.to_blocks(base.hierarchy_step) {
            let object = join_key(&self.prefix, &layout::hierarchy_block(&root, ""));
            let bytes = block_to_json(&entries)?;
            self.retry.run(&object, || self.endpoint.put(&object, &bytes))?;
        }

        let points = hierarchy.total_points();
        let consumed: u64 = sources.iter().map(|s| s.points_inserted).sum();
        let out_of_bounds = consumed
            .saturating_sub(points)
            .saturating_sub(base.invalid)
            .saturating_sub(duplicate_points);

        let manifest = Manifest {
            points,
            out_of_bounds,
            invalid: base.invalid,
            duplicate_points,
            subset: None,
            sources,
            ..base.clone()
        };
        manifest.save(self.endpoint.as_ref(), &self.prefix, "")
    }
}
