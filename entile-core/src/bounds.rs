//! Axis-aligned bounding boxes and octant partitioning.
//!
//! A `Bounds` is the spatial extent of one octree node. Partitioning is
//! always at the center of the box: octant index bit 0 selects the upper
//! half in x, bit 1 in y, bit 2 in z.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Axis-aligned box `[min, max]` in all three dimensions.
///
/// Invariant: `min[i] <= max[i]` for every component. Containment is
/// closed on both ends; octant descent breaks ties toward the lower side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    min: [f64; 3],
    max: [f64; 3],
}

impl Bounds {
    /// Create a new box, validating `min <= max` componentwise.
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Result<Self> {
        for i in 0..3 {
            if !(min[i] <= max[i]) {
                return Err(Error::invalid_input(format!(
                    "bounds min {:?} exceeds max {:?}",
                    min, max
                )));
            }
        }
        Ok(Bounds { min, max })
    }

    pub fn min(&self) -> [f64; 3] {
        self.min
    }

    pub fn max(&self) -> [f64; 3] {
        self.max
    }

    pub fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    pub fn widths(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Closed-box containment. Points on any face, including the maximum
    /// faces, are inside.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Closed containment in x and y only. Used for subset membership,
    /// where the shard box spans the full z range.
    pub fn contains_xy(&self, p: [f64; 3]) -> bool {
        (0..2).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// One of the eight equal sub-boxes. Bit 0 = upper x half, bit 1 = y,
    /// bit 2 = z.
    pub fn octant(&self, i: u8) -> Bounds {
        debug_assert!(i < 8);
        let c = self.center();
        let mut min = self.min;
        let mut max = c;
        for axis in 0..3 {
            if i >> axis & 1 == 1 {
                min[axis] = c[axis];
                max[axis] = self.max[axis];
            }
        }
        Bounds { min, max }
    }

    /// The octant index whose sub-box contains `p`, with ties on a shared
    /// face broken toward the lower octant.
    pub fn octant_of(&self, p: [f64; 3]) -> u8 {
        let c = self.center();
        let mut i = 0u8;
        for axis in 0..3 {
            if p[axis] > c[axis] {
                i |= 1 << axis;
            }
        }
        i
    }

    /// Expand symmetrically about the center by `factor` (1.0 is identity).
    pub fn grow_by(&self, factor: f64) -> Bounds {
        let c = self.center();
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            let half = (self.max[axis] - self.min[axis]) / 2.0 * factor;
            min[axis] = c[axis] - half;
            max[axis] = c[axis] + half;
        }
        Bounds { min, max }
    }

    /// Smallest cube centered on this box that contains it. The builder
    /// cubifies the union of source bounds so octree cells stay cubic.
    pub fn cubeify(&self) -> Bounds {
        let c = self.center();
        let w = self.widths();
        let half = w[0].max(w[1]).max(w[2]) / 2.0;
        Bounds {
            min: [c[0] - half, c[1] - half, c[2] - half],
            max: [c[0] + half, c[1] + half, c[2] + half],
        }
    }

    /// Componentwise union of two boxes.
    pub fn union(&self, other: &Bounds) -> Bounds {
        let mut min = self.min;
        let mut max = self.max;
        for axis in 0..3 {
            min[axis] = min[axis].min(other.min[axis]);
            max[axis] = max[axis].max(other.max[axis]);
        }
        Bounds { min, max }
    }
}
