//! # Entile Core
//!
//! Value types and storage abstraction for the entile point-cloud octree:
//!
//! - Spatial addressing: [`Bounds`], [`ChunkKey`], [`PointKey`]
//! - Point records and schemas: [`Point`], [`Schema`]
//! - The sparse hierarchy and its block layout: [`Hierarchy`]
//! - The build manifest and object layout: [`Manifest`], [`manifest::layout`]
//! - Spatial sharding: [`Subset`]
//! - The storage contract: [`Endpoint`], with in-memory and filesystem
//!   implementations
//!
//! The construction pipeline itself (cells, cache, builder, merger) lives
//! in `entile-builder`.

pub mod bounds;
pub mod endpoint;
pub mod error;
pub mod hierarchy;
pub mod key;
pub mod manifest;
pub mod point;
pub mod schema;
pub mod source;
pub mod subset;

pub use bounds::Bounds;
pub use endpoint::{join_key, Endpoint, FileEndpoint, MemoryEndpoint};
pub use error::{Error, Result};
pub use hierarchy::{block_root, Hierarchy};
pub use key::{ChunkKey, PointKey, MAX_ADDRESSABLE_DEPTH};
pub use manifest::{DataType, Manifest, FORMAT_VERSION};
pub use point::Point;
pub use schema::{DimType, Dimension, ScaleOffset, Schema};
pub use source::{DimensionStat, Source, SourceInfo, SourceStatus};
pub use subset::{Span, Subset};
