//! Building disjoint spatial shards and stitching them back together.

mod common;

use common::{grid_points, read_chunks, read_hierarchy};
use entile_builder::builder::Builder;
use entile_builder::config::{BuildConfig, SubsetSpec};
use entile_builder::merge::Merger;
use entile_builder::reader::{MemoryReader, SourceReader};
use entile_builder::store::RetryPolicy;
use entile_core::manifest::layout;
use entile_core::{Endpoint, Error, Manifest, MemoryEndpoint};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const OF: u64 = 4;

fn config(subset: Option<SubsetSpec>) -> BuildConfig {
    let mut config = BuildConfig::new("out", vec!["a".to_string(), "b".to_string()]);
    config.threads = 1;
    config.span = 16;
    config.chunk_capacity = Some(8);
    config.base_depth = 1;
    config.cache_soft_cap = 8;
    config.evict_interval = 64;
    config.retry_base_delay_ms = 1;
    config.subset = subset;
    config
}

fn reader() -> Arc<MemoryReader> {
    let reader = Arc::new(MemoryReader::new());
    reader.add("a", grid_points(400, 11));
    reader.add("b", grid_points(400, 22));
    reader
}

/// Build all four shards onto one endpoint.
fn build_shards(endpoint: &MemoryEndpoint, reader: &Arc<MemoryReader>) {
    for id in 1..=OF {
        let builder = Builder::new(
            config(Some(SubsetSpec { id, of: OF })),
            Arc::new(endpoint.clone()),
            Arc::clone(reader) as Arc<dyn SourceReader>,
        )
        .unwrap();
        builder.build().unwrap();
    }
}

fn merger(endpoint: &MemoryEndpoint) -> Merger {
    Merger::new(Arc::new(endpoint.clone()), "out", OF)
        .unwrap()
        .with_retry(RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        })
}

/// Snapshot of every object under the prefix.
fn snapshot(endpoint: &MemoryEndpoint) -> BTreeMap<String, Vec<u8>> {
    endpoint
        .list("out/")
        .unwrap()
        .into_iter()
        .map(|k| {
            let bytes = endpoint.get(&k).unwrap();
            (k, bytes)
        })
        .collect()
}

#[test]
fn test_shards_cover_input_disjointly() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    build_shards(&endpoint, &reader);

    let mut inserted = 0u64;
    let mut duplicates = 0u64;
    for id in 1..=OF {
        let m = Manifest::load(&endpoint, "out", &format!("-{}", id))
            .unwrap()
            .unwrap();
        // Shard-local conservation: everything consumed is accounted for.
        assert_eq!(
            m.points + m.out_of_bounds + m.invalid + m.duplicate_points,
            2 * 402
        );
        inserted += m.points;
        duplicates += m.duplicate_points;
    }
    // Each point belongs to exactly one shard column; the two repeated
    // corner anchors are duplicates inside their owning shards.
    assert_eq!(inserted + duplicates, 2 * 402);
    assert_eq!(duplicates, 2);
}

#[test]
fn test_merge_unifies_shards() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    build_shards(&endpoint, &reader);

    let summary = merger(&endpoint).merge().unwrap();
    assert_eq!(summary.shards, OF);
    assert!(summary.already_merged.is_empty());
    assert_eq!(summary.points, 2 * 402 - 2);

    // The unified manifest conserves the one-pass input total.
    let merged = Manifest::load(&endpoint, "out", "").unwrap().unwrap();
    assert!(merged.subset.is_none());
    assert_eq!(merged.points, summary.points);
    assert_eq!(merged.duplicate_points, 2);
    assert_eq!(merged.out_of_bounds, 0);
    assert_eq!(
        merged.points + merged.out_of_bounds + merged.invalid + merged.duplicate_points,
        2 * 402
    );

    // Every merged hierarchy entry has its chunk, no key shallower than
    // the shard grid, and the totals match a non-subset build of the same
    // inputs (the shallow levels aside, which shards never build).
    let hierarchy = read_hierarchy(&endpoint, "out");
    assert!(hierarchy.keys().all(|k| k.depth() >= 1));
    read_chunks(&endpoint, "out", &merged);

    let full_endpoint = MemoryEndpoint::new();
    Builder::new(
        config(None),
        Arc::new(full_endpoint.clone()),
        Arc::clone(&reader) as Arc<dyn SourceReader>,
    )
    .unwrap()
    .build()
    .unwrap();
    let full = Manifest::load(&full_endpoint, "out", "").unwrap().unwrap();
    assert_eq!(full.points, merged.points);
    assert_eq!(full.bounds, merged.bounds);
}

#[test]
fn test_merge_is_idempotent() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    build_shards(&endpoint, &reader);

    merger(&endpoint).merge().unwrap();
    let first = snapshot(&endpoint);

    let summary = merger(&endpoint).merge().unwrap();
    assert_eq!(summary.already_merged, vec![1, 2, 3, 4]);
    assert_eq!(snapshot(&endpoint), first);
}

#[test]
fn test_merge_missing_shard_fails() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    // Only shard 1 exists.
    Builder::new(
        config(Some(SubsetSpec { id: 1, of: OF })),
        Arc::new(endpoint.clone()),
        Arc::clone(&reader) as Arc<dyn SourceReader>,
    )
    .unwrap()
    .build()
    .unwrap();

    assert!(matches!(
        merger(&endpoint).merge(),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn test_merge_detects_key_claimed_twice() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    build_shards(&endpoint, &reader);

    // A rogue extra block for shard 2 re-claims keys shard 2 already
    // owns under a different block root.
    let dir = format!("out/{}/", layout::HIERARCHY_DIR);
    let shard2_block = endpoint
        .list(&dir)
        .unwrap()
        .into_iter()
        .find(|k| {
            let name = k.rsplit('/').next().unwrap();
            matches!(layout::parse_hierarchy_block(name), Some((_, Some(2))))
        })
        .expect("shard 2 wrote at least one block");
    let bytes = endpoint.get(&shard2_block).unwrap();
    endpoint
        .put(&format!("out/{}/3-7-7-7-2.json", layout::HIERARCHY_DIR), &bytes)
        .unwrap();

    assert!(matches!(
        merger(&endpoint).merge(),
        Err(Error::MergeCollision(_))
    ));
}

#[test]
fn test_merge_rejects_foreign_keys() {
    let endpoint = MemoryEndpoint::new();
    let reader = reader();
    build_shards(&endpoint, &reader);

    // Shard 2 (low x, high y) claiming the shard-1 column cell 1-0-0-0.
    endpoint
        .put(
            &format!("out/{}/1-0-0-0-2.json", layout::HIERARCHY_DIR),
            br#"{"1-0-0-0": 3}"#,
        )
        .unwrap();

    assert!(matches!(
        merger(&endpoint).merge(),
        Err(Error::InvalidInput(_))
    ));
}
