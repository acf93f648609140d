//! Shared fixtures for the end-to-end suites.

use entile_builder::codec;
use entile_core::manifest::layout;
use entile_core::{ChunkKey, Endpoint, Manifest, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Every hierarchy entry under `prefix` (merged across unpostfixed blocks).
pub fn read_hierarchy(endpoint: &dyn Endpoint, prefix: &str) -> BTreeMap<ChunkKey, u64> {
    let mut entries = BTreeMap::new();
    for object in endpoint
        .list(&format!("{}/{}/", prefix, layout::HIERARCHY_DIR))
        .unwrap()
    {
        let name = object.rsplit('/').next().unwrap();
        match layout::parse_hierarchy_block(name) {
            Some((_, None)) => {}
            _ => continue,
        }
        let bytes = endpoint.get(&object).unwrap();
        for (key, count) in entile_core::hierarchy::block_from_json(&bytes).unwrap() {
            assert!(entries.insert(key, count).is_none(), "key in two blocks");
        }
    }
    entries
}

/// Chunk contents per key, coordinates sorted for order-insensitive
/// comparison. Asserts every hierarchy entry has a chunk with exactly its
/// count.
pub fn read_chunks(
    endpoint: &dyn Endpoint,
    prefix: &str,
    manifest: &Manifest,
) -> BTreeMap<ChunkKey, Vec<[u64; 3]>> {
    let mut chunks = BTreeMap::new();
    for (key, count) in read_hierarchy(endpoint, prefix) {
        let object = format!(
            "{}/{}",
            prefix,
            layout::chunk(&key, "", manifest.data_type.extension())
        );
        let bytes = endpoint
            .get(&object)
            .unwrap_or_else(|_| panic!("hierarchy names {} but chunk is missing", key));
        let (points, _) = codec::decode(&bytes, &manifest.schema).unwrap();
        assert_eq!(points.len() as u64, count, "chunk {} count mismatch", key);
        let mut coords: Vec<[u64; 3]> = points.iter().map(Point::coord_bits).collect();
        coords.sort();
        chunks.insert(key, coords);
    }
    chunks
}

/// Seeded random points over the 16-unit cube, with the two extreme
/// corners anchored so every source reports identical bounds.
pub fn grid_points(n: u64, salt: u64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(salt);
    let mut points = vec![Point::new(0.0, 0.0, 0.0), Point::new(16.0, 16.0, 16.0)];
    for _ in 0..n {
        points.push(Point::new(
            rng.gen_range(0.0..16.0),
            rng.gen_range(0.0..16.0),
            rng.gen_range(0.0..16.0),
        ));
    }
    points
}
