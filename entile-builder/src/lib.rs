//! # Entile Builder
//!
//! The octree construction pipeline. This crate provides:
//!
//! - Point buckets and the overflow protocol (`cell`)
//! - The binary chunk container (`codec`) and its endpoint adapter
//!   (`store`)
//! - The pin-counted chunk cache (`cache`) and per-worker pin ledger
//!   (`clipper`)
//! - The ingestion driver (`builder`), reader contract (`reader`) and
//!   configuration (`config`)
//! - Subset merging (`merge`)
//!
//! ## Design
//!
//! The pipeline is a fixed pool of OS threads over blocking I/O; the only
//! shared mutable state is the chunk cache (per-key locks under an O(1)
//! index lock), the sharded hierarchy map and a handful of counters. A
//! build is resumable: chunks are immutable append-from-empty objects and
//! the manifest records per-source progress.

pub mod builder;
pub mod cache;
pub mod cell;
pub mod clipper;
pub mod codec;
pub mod config;
pub mod merge;
pub mod reader;
pub mod store;

pub use builder::{BuildSummary, Builder, CancelToken};
pub use cache::{CacheConfig, CellRef, ChunkCache};
pub use cell::{Cell, CellKind, InsertResult};
pub use clipper::Clipper;
pub use config::{BuildConfig, Reprojection, SubsetSpec};
pub use merge::{MergeSummary, Merger};
pub use reader::{MemoryReader, ReadOptions, SourceReader, SourceStream};
pub use store::{ChunkStore, RetryPolicy};
