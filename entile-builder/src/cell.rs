//! Fixed-capacity point buckets, one per resident octree node.
//!
//! Two shapes exist. *Base* cells sit in the shallow levels of the tree
//! and carry a reserved overflow region equal to their capacity; when one
//! finally fills, the overflow region is drained in bulk so the builder
//! can push a whole batch down one level, and the cell is sealed against
//! further inserts. *Overflow* cells are ordinary leaves with no reserve.
//!
//! Overflowing is a normal signal here, not an error; the builder reacts
//! by descending. Exact-coordinate duplicates are detected against a
//! bit-pattern set so the builder can count and drop them.

use entile_core::{ChunkKey, Point};
use rustc_hash::FxHashSet;

/// Shape of a cell: shallow-tree base cell or regular leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Base,
    Overflow,
}

/// Outcome of one insertion attempt.
#[derive(Debug)]
pub enum InsertResult {
    /// The point was stored.
    Inserted,
    /// A point with bit-identical coordinates is already here; the point
    /// is handed back for the caller to count and drop.
    Duplicate(Point),
    /// The cell is full (or sealed); the point descends one level.
    Full(Point),
    /// A base cell just overflowed: its overflow region was drained and
    /// the cell sealed. The drained points and the incoming point all
    /// descend one level.
    Drained(Vec<Point>, Point),
}

/// Points belonging to one octree node.
#[derive(Debug)]
pub struct Cell {
    key: ChunkKey,
    kind: CellKind,
    capacity: usize,
    sealed: bool,
    dirty: bool,
    points: Vec<Point>,
    coords: FxHashSet<[u64; 3]>,
}

impl Cell {
    /// Create an empty cell.
    pub fn new(key: ChunkKey, kind: CellKind, capacity: usize) -> Self {
        Cell {
            key,
            kind,
            capacity,
            sealed: false,
            dirty: false,
            points: Vec::new(),
            coords: FxHashSet::default(),
        }
    }

    /// Rebuild a cell from its persisted form. Reloaded cells start
    /// clean; only new inserts make them dirty again.
    pub fn from_store(
        key: ChunkKey,
        kind: CellKind,
        capacity: usize,
        points: Vec<Point>,
        sealed: bool,
    ) -> Self {
        let coords = points.iter().map(Point::coord_bits).collect();
        Cell {
            key,
            kind,
            capacity,
            sealed,
            dirty: false,
            points,
            coords,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Whether a point with these exact coordinate bit patterns is stored
    /// here.
    pub fn contains_coords(&self, point: &Point) -> bool {
        self.coords.contains(&point.coord_bits())
    }

    /// Capacity currently available to `try_insert`: base cells may fill
    /// their overflow reserve until sealed.
    fn limit(&self) -> usize {
        match self.kind {
            CellKind::Base if !self.sealed => self.capacity * 2,
            _ => self.capacity,
        }
    }

    /// Insert if there is room. Returns `false` when at capacity or
    /// sealed; the caller descends.
    pub fn try_insert(&mut self, point: Point) -> Result<(), Point> {
        if self.sealed || self.points.len() >= self.limit() {
            return Err(point);
        }
        self.push(point);
        Ok(())
    }

    /// Append unconditionally. Only used at the maximum depth, where the
    /// cell is allowed to exceed capacity.
    pub fn force_insert(&mut self, point: Point) {
        self.push(point);
    }

    /// Drain the overflow region of a base cell and seal it. The drained
    /// points leave this cell; their coordinates are forgotten here and
    /// tracked again wherever they land.
    pub fn swap_out_overflow(&mut self) -> Vec<Point> {
        debug_assert_eq!(self.kind, CellKind::Base);
        self.sealed = true;
        self.dirty = true;
        let drained: Vec<Point> = self.points.drain(self.capacity.min(self.points.len())..).collect();
        for p in &drained {
            self.coords.remove(&p.coord_bits());
        }
        drained
    }

    /// One insertion attempt with the full overflow protocol.
    pub fn insert(&mut self, point: Point, at_max_depth: bool) -> InsertResult {
        if self.contains_coords(&point) {
            return InsertResult::Duplicate(point);
        }
        match self.try_insert(point) {
            Ok(()) => InsertResult::Inserted,
            Err(point) if at_max_depth => {
                self.force_insert(point);
                InsertResult::Inserted
            }
            Err(point) => {
                if self.kind == CellKind::Base && !self.sealed {
                    InsertResult::Drained(self.swap_out_overflow(), point)
                } else {
                    InsertResult::Full(point)
                }
            }
        }
    }

    fn push(&mut self, point: Point) {
        self.coords.insert(point.coord_bits());
        self.points.push(point);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(i: usize) -> Point {
        Point::new(i as f64, 0.0, 0.0)
    }

    #[test]
    fn test_overflow_cell_capacity() {
        let mut cell = Cell::new(ChunkKey::ROOT, CellKind::Overflow, 4);
        for i in 0..4 {
            assert!(cell.try_insert(pt(i)).is_ok());
        }
        assert!(cell.try_insert(pt(4)).is_err());
        assert_eq!(cell.len(), 4);
        assert!(cell.is_dirty());
    }

    #[test]
    fn test_base_cell_reserve_and_drain() {
        let mut cell = Cell::new(ChunkKey::ROOT, CellKind::Base, 4);
        // Primary plus reserve: 8 points fit.
        for i in 0..8 {
            assert!(cell.try_insert(pt(i)).is_ok());
        }
        assert!(!cell.sealed());

        // The ninth overflows; the protocol drains the reserve and seals.
        match cell.insert(pt(8), false) {
            InsertResult::Drained(drained, point) => {
                assert_eq!(drained.len(), 4);
                assert_eq!(drained[0], pt(4));
                assert_eq!(point, pt(8));
            }
            other => panic!("expected drain, got {:?}", other),
        }
        assert!(cell.sealed());
        assert_eq!(cell.len(), 4);
        // Drained coordinates are no longer tracked here.
        assert!(!cell.contains_coords(&pt(5)));
        assert!(cell.contains_coords(&pt(2)));

        // Sealed cells refuse even though they have room.
        match cell.insert(pt(9), false) {
            InsertResult::Full(point) => assert_eq!(point, pt(9)),
            other => panic!("expected full, got {:?}", other),
        }
        assert_eq!(cell.len(), 4);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut cell = Cell::new(ChunkKey::ROOT, CellKind::Overflow, 4);
        assert!(matches!(cell.insert(pt(1), false), InsertResult::Inserted));
        assert!(matches!(
            cell.insert(pt(1), false),
            InsertResult::Duplicate(_)
        ));
        assert_eq!(cell.len(), 1);
    }

    #[test]
    fn test_force_insert_at_max_depth() {
        let mut cell = Cell::new(ChunkKey::ROOT, CellKind::Overflow, 2);
        assert!(matches!(cell.insert(pt(0), true), InsertResult::Inserted));
        assert!(matches!(cell.insert(pt(1), true), InsertResult::Inserted));
        // Distinct coordinates past capacity are still appended at the
        // deepest level.
        assert!(matches!(cell.insert(pt(2), true), InsertResult::Inserted));
        assert_eq!(cell.len(), 3);
        // Duplicates are dropped even there.
        assert!(matches!(
            cell.insert(pt(2), true),
            InsertResult::Duplicate(_)
        ));
        assert_eq!(cell.len(), 3);
    }

    #[test]
    fn test_from_store_round_state() {
        let points = vec![pt(0), pt(1), pt(2)];
        let cell = Cell::from_store(ChunkKey::ROOT, CellKind::Base, 4, points, true);
        assert_eq!(cell.len(), 3);
        assert!(cell.sealed());
        assert!(!cell.is_dirty());
        assert!(cell.contains_coords(&pt(1)));
        assert!(!cell.contains_coords(&pt(3)));
    }
}
