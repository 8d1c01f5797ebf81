//! Voxel grid geometry and the signed distance / label field pair.
//!
//! Fields are stored as flat arrays indexed `z * height * width + y * width + x`.
//! A 2D grid is a grid with `depth == 1`.

use serde::{Deserialize, Serialize};

use super::{DistanceExtender, SolverError};
use crate::schema::MAX_OVERLAP_OBJECTS;

/// Magnitude given to non-front voxels before the first extension pass.
const UNRESOLVED_DISTANCE: f32 = 1.0e6;

/// Grid extent in voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDims {
    /// Grid width (X dimension).
    pub width: usize,
    /// Grid height (Y dimension).
    pub height: usize,
    /// Grid depth (Z dimension). 1 for 2D grids.
    pub depth: usize,
}

impl GridDims {
    /// 2D grid.
    pub fn new_2d(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// 3D grid.
    pub fn new_3d(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Check if this is a 3D grid (depth > 1).
    #[inline]
    pub fn is_3d(&self) -> bool {
        self.depth > 1
    }

    /// Total voxel count (width * height * depth).
    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height * self.depth
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert (x, y, z) coordinates to flat index.
    #[inline]
    pub fn idx(&self, x: usize, y: usize, z: usize) -> usize {
        z * self.height * self.width + y * self.width + x
    }

    /// Convert a flat index back to (x, y, z).
    #[inline]
    pub fn coords(&self, i: usize) -> (usize, usize, usize) {
        let slice = self.width * self.height;
        let z = i / slice;
        let rem = i - z * slice;
        (rem % self.width, rem / self.width, z)
    }

    /// Voxels on the outer shell of the grid.
    #[inline]
    pub fn is_boundary(&self, i: usize) -> bool {
        let (x, y, z) = self.coords(i);
        x == 0
            || y == 0
            || x + 1 == self.width
            || y + 1 == self.height
            || (self.is_3d() && (z == 0 || z + 1 == self.depth))
    }

    /// Number of (x mod 2, y mod 2[, z mod 2]) classes: 4 in 2D, 8 in 3D.
    #[inline]
    pub fn parity_classes(&self) -> usize {
        if self.is_3d() { 8 } else { 4 }
    }

    /// Parity class of a voxel. Two distinct voxels of the same class are never
    /// within each other's 3x3(x3) neighborhood.
    #[inline]
    pub fn parity(&self, i: usize) -> usize {
        let (x, y, z) = self.coords(i);
        (x & 1) | ((y & 1) << 1) | ((z & 1) << 2)
    }

    /// Neighbor at a signed offset, or None outside the grid.
    #[inline]
    pub fn offset(&self, i: usize, dx: i32, dy: i32, dz: i32) -> Option<usize> {
        let (x, y, z) = self.coords(i);
        let nx = x.checked_add_signed(dx as isize).filter(|&v| v < self.width)?;
        let ny = y.checked_add_signed(dy as isize).filter(|&v| v < self.height)?;
        let nz = z.checked_add_signed(dz as isize).filter(|&v| v < self.depth)?;
        Some(self.idx(nx, ny, nz))
    }

    /// Neighbor at a signed offset with replicated (clamped) boundaries.
    #[inline]
    pub fn clamped(&self, i: usize, dx: i32, dy: i32, dz: i32) -> usize {
        let (x, y, z) = self.coords(i);
        let clamp = |v: usize, d: i32, n: usize| -> usize {
            (v as isize + d as isize).clamp(0, n as isize - 1) as usize
        };
        self.idx(
            clamp(x, dx, self.width),
            clamp(y, dy, self.height),
            clamp(z, dz, self.depth),
        )
    }

    /// In-grid face neighbors (4 in 2D, 6 in 3D).
    #[inline]
    pub fn face_neighbors(self, i: usize) -> impl Iterator<Item = usize> {
        let (x, y, z) = self.coords(i);
        let row = self.width;
        let slice = self.width * self.height;
        [
            (x > 0).then(|| i - 1),
            (x + 1 < self.width).then(|| i + 1),
            (y > 0).then(|| i - row),
            (y + 1 < self.height).then(|| i + row),
            (z > 0).then(|| i - slice),
            (z + 1 < self.depth).then(|| i + slice),
        ]
        .into_iter()
        .flatten()
    }
}

/// How label values map to objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelMode {
    /// Each voxel belongs to exactly one object id (0 = background).
    #[default]
    Exclusive,
    /// Labels are bitmasks; bit k set means the voxel belongs to object k.
    Overlap,
}

impl LabelMode {
    /// Check whether `label` belongs to `object`.
    #[inline]
    pub fn contains(self, label: u32, object: u32) -> bool {
        match self {
            LabelMode::Exclusive => label == object,
            LabelMode::Overlap => {
                (object as usize) < MAX_OVERLAP_OBJECTS && label & (1 << object) != 0
            }
        }
    }
}

/// Dense distance and label arrays of one grid.
///
/// The stored distance is negative inside any object (non-zero label) and its
/// magnitude is the distance to the nearest label boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSetField {
    pub dims: GridDims,
    pub distance: Vec<f32>,
    pub labels: Vec<u32>,
}

impl LevelSetField {
    /// Build a field from labels alone: front voxels sit half a voxel from the
    /// interface and the remaining band is extended `layers` deep.
    pub fn from_labels(
        dims: GridDims,
        labels: Vec<u32>,
        layers: usize,
    ) -> Result<Self, SolverError> {
        let mut field = Self::front_initialized(dims, labels)?;
        let limit = (layers + 1) as f32;
        for (d, &label) in field.distance.iter_mut().zip(field.labels.iter()) {
            *d = Self::signed(label, d.abs().min(limit));
        }
        let mut extender = DistanceExtender::new(dims.len(), layers);
        extender.extend_full(&mut field);
        Ok(field)
    }

    /// Labels plus a front-only distance (±0.5 at the front, large elsewhere).
    fn front_initialized(dims: GridDims, labels: Vec<u32>) -> Result<Self, SolverError> {
        if labels.len() != dims.len() {
            return Err(SolverError::ShapeMismatch {
                field: "labels",
                expected: dims.len(),
                actual: labels.len(),
            });
        }
        let mut field = Self {
            dims,
            distance: vec![0.0; dims.len()],
            labels,
        };
        for i in 0..dims.len() {
            let magnitude = if field.is_front(i) {
                0.5
            } else {
                UNRESOLVED_DISTANCE
            };
            field.distance[i] = Self::signed(field.labels[i], magnitude);
        }
        Ok(field)
    }

    /// Apply the inside/outside sign of `label` to a magnitude.
    #[inline]
    pub fn signed(label: u32, magnitude: f32) -> f32 {
        if label != 0 { -magnitude } else { magnitude }
    }

    /// Level set value of `object` at voxel `i` (negative inside the object).
    #[inline]
    pub fn phi(&self, i: usize, object: u32, mode: LabelMode) -> f32 {
        let magnitude = self.distance[i].abs();
        if mode.contains(self.labels[i], object) {
            -magnitude
        } else {
            magnitude
        }
    }

    /// A voxel is on the front when a face neighbor carries a different label.
    #[inline]
    pub fn is_front(&self, i: usize) -> bool {
        let label = self.labels[i];
        self.dims.face_neighbors(i).any(|n| self.labels[n] != label)
    }

    /// Copy distance and label entries at `indices` from `other`.
    pub fn copy_indices_from(&mut self, other: &LevelSetField, indices: &[usize]) {
        for &i in indices {
            self.distance[i] = other.distance[i];
            self.labels[i] = other.labels[i];
        }
    }

    /// Number of voxels whose label belongs to `object`.
    pub fn object_area(&self, object: u32, mode: LabelMode) -> usize {
        self.labels
            .iter()
            .filter(|&&l| mode.contains(l, object))
            .count()
    }
}
