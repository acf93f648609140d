//! The build manifest and the on-endpoint object layout.
//!
//! The manifest is the single source of truth for readers: schema, bounds,
//! counts, anomaly counters and the per-source status list. It is written
//! last, after every chunk and hierarchy block is durable.
//!
//! Layout under an output prefix `P`:
//! - `P/ept.json` — manifest (`ept-<id>.json` for shard builds)
//! - `P/ept-hierarchy/<d>-<x>-<y>-<z>.json` — hierarchy blocks
//! - `P/ept-data/<d>-<x>-<y>-<z>.<ext>` — chunks
//! - `P/ept-sources/list.json`, `P/ept-sources/<stem>.json` — source info
//! - `P/ept-merge/merged-<id>.json` — per-shard merge markers

use crate::bounds::Bounds;
use crate::endpoint::{join_key, Endpoint};
use crate::error::Result;
use crate::key::ChunkKey;
use crate::schema::Schema;
use crate::source::Source;
use crate::subset::Subset;
use serde::{Deserialize, Serialize};

/// Manifest format version.
pub const FORMAT_VERSION: &str = "1.0.0";

/// Payload encoding of the persisted chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Compressed LAS; produced by the external format stack, not the
    /// core codec.
    Laz,
    /// Raw packed tuples.
    Binary,
    /// Zstandard-compressed packed tuples.
    Zstandard,
}

impl DataType {
    /// Object-key extension for chunk files of this encoding.
    pub fn extension(&self) -> &'static str {
        match self {
            DataType::Laz => "laz",
            DataType::Binary => "bin",
            DataType::Zstandard => "ewck",
        }
    }
}

/// Top-level build manifest (`ept.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    /// Cubified bounds the octree is built over.
    pub bounds: Bounds,
    /// Tight union of the source bounds.
    pub bounds_conforming: Bounds,
    pub points: u64,
    /// Cube side length in addressable units.
    pub span: u64,
    pub chunk_capacity: u64,
    pub hierarchy_step: u32,
    pub data_type: DataType,
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    pub out_of_bounds: u64,
    pub invalid: u64,
    pub duplicate_points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
    pub sources: Vec<Source>,
    pub software: String,
}

impl Manifest {
    /// Write the manifest plus the `ept-sources` objects.
    pub fn save(&self, endpoint: &dyn Endpoint, prefix: &str, postfix: &str) -> Result<()> {
        endpoint.put(
            &join_key(prefix, &layout::sources_list(postfix)),
            &serde_json::to_vec_pretty(&self.sources)?,
        )?;
        for source in &self.sources {
            if let Some(info) = &source.info {
                endpoint.put(
                    &join_key(prefix, &layout::source_info(&source.stem(), postfix)),
                    &serde_json::to_vec_pretty(info)?,
                )?;
            }
        }
        endpoint.put(
            &join_key(prefix, &layout::manifest(postfix)),
            &serde_json::to_vec_pretty(self)?,
        )
    }

    /// Load a manifest if one exists at the prefix.
    pub fn load(endpoint: &dyn Endpoint, prefix: &str, postfix: &str) -> Result<Option<Manifest>> {
        let key = join_key(prefix, &layout::manifest(postfix));
        if !endpoint.exists(&key)? {
            return Ok(None);
        }
        let bytes = endpoint.get(&key)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Relative object names under the output prefix.
pub mod layout {
    use super::*;

    pub const HIERARCHY_DIR: &str = "ept-hierarchy";
    pub const DATA_DIR: &str = "ept-data";
    pub const SOURCES_DIR: &str = "ept-sources";
    pub const MERGE_DIR: &str = "ept-merge";

    pub fn manifest(postfix: &str) -> String {
        format!("ept{}.json", postfix)
    }

    pub fn hierarchy_block(root: &ChunkKey, postfix: &str) -> String {
        format!("{}/{}{}.json", HIERARCHY_DIR, root, postfix)
    }

    pub fn chunk(key: &ChunkKey, postfix: &str, ext: &str) -> String {
        format!("{}/{}{}.{}", DATA_DIR, key, postfix, ext)
    }

    pub fn sources_list(postfix: &str) -> String {
        format!("{}/list{}.json", SOURCES_DIR, postfix)
    }

    pub fn source_info(stem: &str, postfix: &str) -> String {
        format!("{}/{}{}.json", SOURCES_DIR, stem, postfix)
    }

    pub fn merged_marker(id: u64) -> String {
        format!("{}/merged-{}.json", MERGE_DIR, id)
    }

    /// Parse a hierarchy block filename back into its root key and
    /// optional shard postfix: `"2-1-0-1.json"` is an unpostfixed block,
    /// `"2-1-0-1-3.json"` belongs to shard 3. Returns `None` for names
    /// that are not block files.
    pub fn parse_hierarchy_block(name: &str) -> Option<(ChunkKey, Option<u64>)> {
        let stem = name.strip_suffix(".json")?;
        let segments: Vec<&str> = stem.split('-').collect();
        match segments.len() {
            4 => stem.parse::<ChunkKey>().ok().map(|k| (k, None)),
            5 => {
                let key = segments[..4].join("-").parse::<ChunkKey>().ok()?;
                let id = segments[4].parse::<u64>().ok()?;
                Some((key, Some(id)))
            }
            _ => None,
        }
    }
}
