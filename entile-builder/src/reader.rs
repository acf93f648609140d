//! The reader contract the builder consumes.
//!
//! Point decoding, reprojection and stats live behind these traits; the
//! format stack (LAS/LAZ/CSV, selected by extension or pipeline) is an
//! external collaborator. The builder only pulls: `next_batch` is a
//! blocking call, which keeps the worker pool free of any async-runtime
//! coupling and lets slow decode naturally backpressure ingestion.
//!
//! Pipeline preparation is not thread-safe in the external stack.
//! Implementations hold [`prepare_lock`] across that substep only and
//! release it before executing, so the decode-heavy remainder of
//! `open`/`info` runs unlocked — the builder fans both calls out across
//! its worker pool.

use crate::config::Reprojection;
use entile_core::{Bounds, DimType, DimensionStat, Error, Point, Result, SourceInfo};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;

/// Options forwarded to the reader stack when opening a source.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub reprojection: Option<Reprojection>,
}

/// An open cursor over one source's points.
pub trait SourceStream: Send {
    /// Pull up to `n` points. An empty batch means end of stream.
    fn next_batch(&mut self, n: usize) -> Result<Vec<Point>>;
}

/// Factory and analyzer for point sources. Shared read-only by all
/// workers; streams returned by `open` belong to one worker.
pub trait SourceReader: Send + Sync {
    /// Open a source for streaming.
    fn open(&self, path: &str, options: &ReadOptions) -> Result<Box<dyn SourceStream>>;

    /// Analyze a source: bounds, count, SRS, dimension stats.
    fn info(&self, path: &str, options: &ReadOptions) -> Result<SourceInfo>;
}

static PREPARE_LOCK: Mutex<()> = Mutex::new(());

/// The process-wide reader preparation lock. The external stack requires
/// single-threaded pipeline preparation; implementations hold this across
/// that substep and drop it before executing the pipeline.
pub fn prepare_lock() -> MutexGuard<'static, ()> {
    PREPARE_LOCK.lock()
}

// ============================================================================
// MemoryReader
// ============================================================================

/// In-memory reader for tests and programmatic ingestion.
#[derive(Default)]
pub struct MemoryReader {
    sources: RwLock<HashMap<String, Vec<Point>>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under `path`.
    pub fn add(&self, path: impl Into<String>, points: Vec<Point>) {
        self.sources.write().insert(path.into(), points);
    }

    fn points_for(&self, path: &str) -> Result<Vec<Point>> {
        self.sources
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::invalid_input(format!("unknown source '{}'", path)))
    }
}

impl SourceReader for MemoryReader {
    fn open(&self, path: &str, _options: &ReadOptions) -> Result<Box<dyn SourceStream>> {
        // Preparation here is just the source lookup.
        let points = {
            let _guard = prepare_lock();
            self.points_for(path)?
        };
        Ok(Box::new(MemoryStream { points, at: 0 }))
    }

    fn info(&self, path: &str, _options: &ReadOptions) -> Result<SourceInfo> {
        let points = {
            let _guard = prepare_lock();
            self.points_for(path)?
        };
        // Stats run unlocked; concurrent scans only contend on the lookup.
        let finite: Vec<&Point> = points.iter().filter(|p| p.is_finite()).collect();
        let bounds = finite.split_first().map(|(first, rest)| {
            let mut min = first.position();
            let mut max = first.position();
            for p in rest {
                for axis in 0..3 {
                    min[axis] = min[axis].min(p.position()[axis]);
                    max[axis] = max[axis].max(p.position()[axis]);
                }
            }
            Bounds::new(min, max).expect("min <= max by construction")
        });
        let dimensions = bounds
            .map(|b| {
                ["X", "Y", "Z"]
                    .into_iter()
                    .enumerate()
                    .map(|(axis, name)| DimensionStat {
                        name: name.to_string(),
                        dtype: DimType::Double,
                        min: b.min()[axis],
                        max: b.max()[axis],
                        scale: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(SourceInfo {
            bounds,
            points: points.len() as u64,
            srs: None,
            dimensions,
            errors: Vec::new(),
        })
    }
}

struct MemoryStream {
    points: Vec<Point>,
    at: usize,
}

impl SourceStream for MemoryStream {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Point>> {
        let end = (self.at + n).min(self.points.len());
        let batch = self.points[self.at..end].to_vec();
        self.at = end;
        Ok(batch)
    }
}
