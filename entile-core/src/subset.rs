//! Spatial sharding of a build into disjoint sub-trees.
//!
//! A subset `(id, of)` with `of = 4^k` owns one cell of the `2^k x 2^k`
//! grid made by splitting the global XY bounds alternately in x and y `k`
//! times; the shard box spans the full z range. Cells are ordered
//! x-major: `id` 1 is the minimum-x / minimum-y cell, and y varies
//! fastest. Nothing shallower than `minimum_null_depth = k` is built by a
//! shard, so shard key sets are disjoint and the merger can stitch them
//! without rewriting cells.

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::key::ChunkKey;
use serde::{Deserialize, Serialize};

/// Contiguous range `[begin, end)` of 2-D Morton codes at one depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    begin: u64,
    end: u64,
}

impl Span {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end);
        Span { begin, end }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, code: u64) -> bool {
        code >= self.begin && code < self.end
    }

    /// Extend this span by an adjacent one. Spans that do not line up
    /// cannot be merged.
    pub fn merge(&mut self, other: Span) -> Result<()> {
        if self.end != other.begin {
            return Err(Error::invalid_input(format!(
                "cannot merge spans [{}, {}) and [{}, {})",
                self.begin, self.end, other.begin, other.end
            )));
        }
        self.end = other.end;
        Ok(())
    }

    /// The parent-depth span: one quadtree level up, four children per
    /// cell.
    pub fn up(&mut self) {
        self.begin >>= 2;
        self.end = (self.end + 3) >> 2;
    }
}

/// Descriptor of one spatial shard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Subset {
    id: u64,
    of: u64,
    #[serde(skip)]
    sub: Option<Bounds>,
    #[serde(skip)]
    minimum_null_depth: u32,
}

impl Subset {
    /// Create a shard descriptor. `of` must be a power of four and `id`
    /// in `[1, of]`.
    pub fn new(global: &Bounds, id: u64, of: u64) -> Result<Self> {
        if of == 0 || !of.is_power_of_two() || of.trailing_zeros() % 2 != 0 {
            return Err(Error::invalid_input(format!(
                "subset 'of' must be a power of four, got {}",
                of
            )));
        }
        if id == 0 || id > of {
            return Err(Error::invalid_input(format!(
                "subset id must be in [1, {}], got {}",
                of, id
            )));
        }

        let k = of.trailing_zeros() / 2;
        let n = 1u64 << k;
        let x_idx = (id - 1) / n;
        let y_idx = (id - 1) % n;

        let min = global.min();
        let max = global.max();
        let w = (max[0] - min[0]) / n as f64;
        let h = (max[1] - min[1]) / n as f64;
        let sub = Bounds::new(
            [min[0] + x_idx as f64 * w, min[1] + y_idx as f64 * h, min[2]],
            [
                min[0] + (x_idx + 1) as f64 * w,
                min[1] + (y_idx + 1) as f64 * h,
                max[2],
            ],
        )?;

        Ok(Subset {
            id,
            of,
            sub: Some(sub),
            minimum_null_depth: k,
        })
    }

    /// Reconstruct the derived fields after deserializing `{id, of}` from
    /// a manifest.
    pub fn resolve(&self, global: &Bounds) -> Result<Subset> {
        Subset::new(global, self.id, self.of)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn of(&self) -> u64 {
        self.of
    }

    /// The shard's box; present once derived from the global bounds.
    pub fn bounds(&self) -> &Bounds {
        self.sub
            .as_ref()
            .expect("subset bounds not resolved against global bounds")
    }

    /// Depth at which this shard's cells begin; nothing shallower is
    /// built by the shard.
    pub fn minimum_null_depth(&self) -> u32 {
        self.minimum_null_depth
    }

    /// Object-key suffix preventing cross-shard collisions during the
    /// build.
    pub fn postfix(&self) -> String {
        format!("-{}", self.id)
    }

    /// The first shard writes shared artifacts exactly once.
    pub fn primary(&self) -> bool {
        self.id == 1
    }

    /// The shard's grid cell indices `(x, y)` at the shard grid depth.
    fn cell_indices(&self) -> (u64, u64) {
        let n = 1u64 << self.minimum_null_depth;
        ((self.id - 1) / n, (self.id - 1) % n)
    }

    /// For each depth `d` in `[minimum_null_depth, depth_end)`, the
    /// contiguous 2-D Morton range of `(x, y)` positions this shard owns
    /// at that depth (z is unrestricted). Shallower depths map to empty
    /// spans.
    pub fn calc_spans(&self, depth_end: u32) -> Vec<Span> {
        let k = self.minimum_null_depth;
        let (x_idx, y_idx) = self.cell_indices();
        let base = ChunkKey::new(k, x_idx, y_idx, 0).morton_xy();

        let mut spans = vec![Span::default(); depth_end as usize];
        if depth_end <= k {
            return spans;
        }

        // Deepest first, then walk up a quadtree level at a time; the
        // shard cell stays one contiguous Morton run at every depth.
        let deepest = depth_end - 1;
        let shift = 2 * (deepest - k);
        let mut span = Span::new(base << shift, (base + 1) << shift);
        for d in (k..depth_end).rev() {
            spans[d as usize] = span;
            span.up();
        }
        spans
    }

    /// Whether this shard owns `key`: at or below the null depth, with the
    /// key's XY ancestor cell inside the shard cell.
    pub fn owns(&self, key: &ChunkKey) -> bool {
        if key.depth() < self.minimum_null_depth {
            return false;
        }
        let spans = self.calc_spans(key.depth() + 1);
        spans[key.depth() as usize].contains(ChunkKey::new(key.depth(), key.x(), key.y(), 0).morton_xy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> Bounds {
        Bounds::new([0.0; 3], [16.0; 3]).unwrap()
    }

    #[test]
    fn test_validation() {
        let g = global();
        assert!(Subset::new(&g, 1, 4).is_ok());
        assert!(Subset::new(&g, 16, 16).is_ok());
        assert!(Subset::new(&g, 1, 2).is_err()); // power of two, not of four
        assert!(Subset::new(&g, 1, 0).is_err());
        assert!(Subset::new(&g, 0, 4).is_err());
        assert!(Subset::new(&g, 5, 4).is_err());
    }

    #[test]
    fn test_of_four_boxes() {
        let g = global();
        // x-major order: id 3 is the high-x / low-y cell.
        let s = Subset::new(&g, 3, 4).unwrap();
        assert_eq!(s.bounds().min(), [8.0, 0.0, 0.0]);
        assert_eq!(s.bounds().max(), [16.0, 8.0, 16.0]);
        assert_eq!(s.minimum_null_depth(), 1);
        assert_eq!(s.postfix(), "-3");
        assert!(!s.primary());

        assert_eq!(Subset::new(&g, 1, 4).unwrap().bounds().min(), [0.0, 0.0, 0.0]);
        assert_eq!(Subset::new(&g, 2, 4).unwrap().bounds().min(), [0.0, 8.0, 0.0]);
        assert_eq!(Subset::new(&g, 4, 4).unwrap().bounds().min(), [8.0, 8.0, 0.0]);
        assert!(Subset::new(&g, 1, 4).unwrap().primary());
    }

    #[test]
    fn test_boxes_tile_the_plane() {
        let g = global();
        for of in [4u64, 16, 64] {
            let mut area = 0.0;
            for id in 1..=of {
                let s = Subset::new(&g, id, of).unwrap();
                let w = s.bounds().widths();
                area += w[0] * w[1];
            }
            assert!((area - 256.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_spans_cover_each_depth() {
        // Property: the union of spans over all ids covers every position
        // exactly once at each depth.
        let g = global();
        for of in [4u64, 16] {
            let k = of.trailing_zeros() / 2;
            let depth_end = k + 3;
            for d in k..depth_end {
                let cells_at_depth = 1u64 << (2 * d);
                let mut seen = vec![false; cells_at_depth as usize];
                for id in 1..=of {
                    let spans = Subset::new(&g, id, of).unwrap().calc_spans(depth_end);
                    let span = spans[d as usize];
                    assert_eq!(span.len(), cells_at_depth / of);
                    for code in span.begin()..span.end() {
                        assert!(!seen[code as usize], "code {} claimed twice", code);
                        seen[code as usize] = true;
                    }
                }
                assert!(seen.iter().all(|&s| s));
            }
        }
    }

    #[test]
    fn test_spans_empty_above_null_depth() {
        let g = global();
        let s = Subset::new(&g, 2, 16).unwrap();
        assert_eq!(s.minimum_null_depth(), 2);
        let spans = s.calc_spans(5);
        assert!(spans[0].is_empty());
        assert!(spans[1].is_empty());
        assert!(!spans[2].is_empty());
        assert_eq!(spans[2].len(), 1);
        assert_eq!(spans[3].len(), 4);
        assert_eq!(spans[4].len(), 16);
    }

    #[test]
    fn test_owns() {
        let g = global();
        let s3 = Subset::new(&g, 3, 4).unwrap();
        // Root is above the null depth: nobody owns it.
        assert!(!s3.owns(&ChunkKey::ROOT));
        // Depth-1 cell (1, 0, *) is shard 3's cell (x high, y low).
        assert!(s3.owns(&ChunkKey::new(1, 1, 0, 0)));
        assert!(s3.owns(&ChunkKey::new(1, 1, 0, 1)));
        assert!(!s3.owns(&ChunkKey::new(1, 0, 0, 0)));
        // Its descendants stay owned.
        assert!(s3.owns(&ChunkKey::new(2, 3, 1, 2)));
        assert!(!s3.owns(&ChunkKey::new(2, 1, 1, 2)));
    }

    #[test]
    fn test_span_merge_and_up() {
        let mut a = Span::new(0, 4);
        let b = Span::new(4, 8);
        a.merge(b).unwrap();
        assert_eq!(a, Span::new(0, 8));
        assert!(a.merge(Span::new(12, 16)).is_err());

        a.up();
        assert_eq!(a, Span::new(0, 2));
        let mut c = Span::new(4, 8);
        c.up();
        assert_eq!(c, Span::new(1, 2));
    }
}
