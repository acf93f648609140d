//! Build configuration

use entile_core::key::MAX_ADDRESSABLE_DEPTH;
use entile_core::{DataType, Error, Result};
use serde::{Deserialize, Serialize};

/// Default cube side length in addressable units.
pub const DEFAULT_SPAN: u64 = 256;

/// Default hierarchy block step.
pub const DEFAULT_HIERARCHY_STEP: u32 = 6;

/// Default absolute descent cap.
pub const DEFAULT_MAX_DEPTH: u32 = 26;

/// Default number of base-cell levels below the (subset) root.
pub const DEFAULT_BASE_DEPTH: u32 = 2;

/// Default points pulled per reader batch.
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Default number of points between cache eviction sweeps.
pub const DEFAULT_EVICT_INTERVAL: u64 = 65_536;

/// Default soft cap on resident cells.
pub const DEFAULT_CACHE_SOFT_CAP: usize = 512;

/// Default endpoint retry attempts for transient failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Optional reprojection, passed through to the reader stack untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reprojection {
    /// Input SRS override; when absent the source's own SRS applies.
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_srs: Option<String>,
    /// Output SRS all points are projected into.
    #[serde(rename = "out")]
    pub out_srs: String,
    /// Force the override even over sources that declare an SRS.
    #[serde(default)]
    pub hammer: bool,
}

/// Spatial shard selection: build shard `id` of `of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetSpec {
    pub id: u64,
    pub of: u64,
}

/// Configuration for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Output key prefix on the endpoint.
    pub output: String,

    /// Source paths handed to the reader stack.
    pub input: Vec<String>,

    /// Worker pool size.
    ///
    /// Default: hardware concurrency.
    pub threads: usize,

    /// Cube side length in addressable units. Must be a power of two.
    /// Default: 256.
    pub span: u64,

    /// Per-cell point capacity. Base cells additionally reserve the same
    /// amount as an overflow buffer.
    ///
    /// Default: derived from `span` (`span * span`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_capacity: Option<u64>,

    /// Depth step between hierarchy block roots. Default: 6.
    pub hierarchy_step: u32,

    /// Chunk payload encoding. `Laz` belongs to the external format stack
    /// and is rejected by the core codec.
    ///
    /// Default: `Zstandard`.
    pub data_type: DataType,

    /// Coordinate quantization grid. When unset, derived from the source
    /// scale declarations; when no source declares one, coordinates are
    /// stored as raw doubles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<[f64; 3]>,

    /// Quantization origin. When unset with a scale in effect, the center
    /// of the conforming bounds, rounded to whole units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<[f64; 3]>,

    /// Reprojection request passed through to the reader stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprojection: Option<Reprojection>,

    /// Build one spatial shard of a larger build. `of` must be a power of
    /// four.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<SubsetSpec>,

    /// Absolute descent cap; deeper insertion is forced into the deepest
    /// cell. Default: 26.
    pub max_depth: u32,

    /// Re-ingest every source from scratch, ignoring recorded statuses.
    /// Existing chunks at the prefix are overwritten, not appended to.
    pub reset_files: bool,

    /// Levels of base cells below the (subset) root. Default: 2.
    pub base_depth: u32,

    /// Points pulled per reader batch; also the clip granularity.
    /// Default: 4096.
    pub batch_size: usize,

    /// Points between cache eviction sweeps per worker. Default: 65,536.
    pub evict_interval: u64,

    /// Soft cap on resident cells before eviction kicks in. Default: 512.
    pub cache_soft_cap: usize,

    /// Endpoint retry attempts for transient failures. Default: 5.
    pub retry_attempts: u32,

    /// Base backoff delay in milliseconds, doubled per attempt.
    /// Default: 100.
    pub retry_base_delay_ms: u64,
}

impl BuildConfig {
    /// A configuration with defaults for everything but the inputs and
    /// output prefix.
    pub fn new(output: impl Into<String>, input: Vec<String>) -> Self {
        BuildConfig {
            output: output.into(),
            input,
            threads: default_threads(),
            span: DEFAULT_SPAN,
            chunk_capacity: None,
            hierarchy_step: DEFAULT_HIERARCHY_STEP,
            data_type: DataType::Zstandard,
            scale: None,
            offset: None,
            reprojection: None,
            subset: None,
            max_depth: DEFAULT_MAX_DEPTH,
            reset_files: false,
            base_depth: DEFAULT_BASE_DEPTH,
            batch_size: DEFAULT_BATCH_SIZE,
            evict_interval: DEFAULT_EVICT_INTERVAL,
            cache_soft_cap: DEFAULT_CACHE_SOFT_CAP,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay_ms: 100,
        }
    }

    /// Effective per-cell capacity.
    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity.unwrap_or(self.span * self.span)
    }

    /// Validate every cross-field constraint.
    pub fn validate(&self) -> Result<()> {
        if self.output.is_empty() {
            return Err(Error::invalid_input("output prefix is required"));
        }
        if self.input.is_empty() {
            return Err(Error::invalid_input("at least one input source is required"));
        }
        if self.threads == 0 {
            return Err(Error::invalid_input("threads must be at least 1"));
        }
        if self.span < 2 || !self.span.is_power_of_two() {
            return Err(Error::invalid_input(format!(
                "span must be a power of two >= 2, got {}",
                self.span
            )));
        }
        if self.chunk_capacity() < 2 {
            return Err(Error::invalid_input("chunk capacity must be at least 2"));
        }
        if self.hierarchy_step == 0 {
            return Err(Error::invalid_input("hierarchy step must be at least 1"));
        }
        if self.data_type == DataType::Laz {
            return Err(Error::invalid_input(
                "laz chunk encoding requires the external format stack; use binary or zstandard",
            ));
        }
        if let Some(scale) = &self.scale {
            if scale.iter().any(|s| !(*s > 0.0)) {
                return Err(Error::invalid_input(format!(
                    "scale must be positive, got {:?}",
                    scale
                )));
            }
        }
        if self.max_depth == 0 || self.max_depth > MAX_ADDRESSABLE_DEPTH {
            return Err(Error::invalid_input(format!(
                "max depth must be in [1, {}], got {}",
                MAX_ADDRESSABLE_DEPTH, self.max_depth
            )));
        }
        if let Some(subset) = &self.subset {
            if subset.of == 0
                || !subset.of.is_power_of_two()
                || subset.of.trailing_zeros() % 2 != 0
            {
                return Err(Error::invalid_input(format!(
                    "subset 'of' must be a power of four, got {}",
                    subset.of
                )));
            }
            if subset.id == 0 || subset.id > subset.of {
                return Err(Error::invalid_input(format!(
                    "subset id must be in [1, {}], got {}",
                    subset.of, subset.id
                )));
            }
            // Shard ownership spans are 2-D Morton ranges in a u64;
            // 4^depth must fit.
            if self.max_depth > 31 {
                return Err(Error::invalid_input(format!(
                    "subset builds support max depth up to 31, got {}",
                    self.max_depth
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_input("batch size must be at least 1"));
        }
        if self.cache_soft_cap == 0 {
            return Err(Error::invalid_input("cache soft cap must be at least 1"));
        }
        Ok(())
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
