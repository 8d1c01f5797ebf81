//! Explicit active list of voxels inside the narrow band.
//!
//! The list is maintained incrementally with the chunked primitives in
//! [`super::scan`]: stale entries are compacted away, and face neighbors that
//! entered the band are scattered past the tail. A full rebuild runs at init
//! and whenever an append would overflow the reserved capacity.

use rayon::prelude::*;

use super::scan::{compact, exclusive_scan, expand, split_at_offsets};
use super::{LevelSetField, SolverError};

/// Active voxel indices plus a membership mask for duplicate-free appends.
#[derive(Debug, Clone)]
pub struct NarrowBand {
    indices: Vec<usize>,
    capacity: usize,
    member: Vec<bool>,
    layers: f32,
    stride: usize,
    budget: usize,
    rebuilds: u64,
}

impl NarrowBand {
    /// Empty band for a grid of `len` voxels. `budget` caps the list size.
    pub fn new(len: usize, layers: usize, stride: usize, budget: usize) -> Self {
        Self {
            indices: Vec::new(),
            capacity: 0,
            member: vec![false; len],
            layers: layers as f32,
            stride: stride.max(1),
            budget,
            rebuilds: 0,
        }
    }

    /// Rescan the whole grid: afterwards the list is exactly `{v : |d(v)| <= L}`.
    pub fn rebuild(&mut self, field: &LevelSetField) -> Result<(), SolverError> {
        let layers = self.layers;
        let stride = self.stride;
        let counts: Vec<usize> = field
            .distance
            .par_chunks(stride)
            .map(|chunk| chunk.iter().filter(|d| d.abs() <= layers).count())
            .collect();

        let (offsets, total) = exclusive_scan(&counts);
        if total > self.budget {
            return Err(SolverError::ResourceExhausted {
                requested: total,
                budget: self.budget,
            });
        }

        let len = field.distance.len();
        let capacity = ((total as f64 * 1.25).ceil() as usize)
            .max(len / 10)
            .min(len)
            .max(total);

        let mut indices = Vec::with_capacity(capacity);
        indices.resize(total, 0);
        split_at_offsets(&mut indices, &offsets)
            .into_par_iter()
            .zip(field.distance.par_chunks(stride).enumerate())
            .for_each(|(dst, (c, chunk))| {
                let base = c * stride;
                let hits = chunk
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.abs() <= layers)
                    .map(|(k, _)| base + k);
                for (slot, i) in dst.iter_mut().zip(hits) {
                    *slot = i;
                }
            });

        self.member
            .par_iter_mut()
            .zip(field.distance.par_iter())
            .for_each(|(m, d)| *m = d.abs() <= layers);

        self.indices = indices;
        self.capacity = capacity;
        self.rebuilds += 1;
        log::debug!(
            "Rebuilt narrow band: {} active voxels, capacity {}",
            total,
            capacity
        );
        Ok(())
    }

    /// Drop entries that left the band. Entries for which `keep_stale` returns
    /// true are retained even when out of band.
    pub fn delete<F>(&mut self, field: &LevelSetField, keep_stale: F)
    where
        F: Fn(usize) -> bool + Sync,
    {
        let layers = self.layers;
        let kept = compact(&self.indices, self.stride, |&i| {
            field.distance[i].abs() <= layers || keep_stale(i)
        });
        if kept.len() == self.indices.len() {
            return;
        }
        for &i in &self.indices {
            self.member[i] = false;
        }
        for &i in &kept {
            self.member[i] = true;
        }
        self.indices = kept;
    }

    /// Append face neighbors of active voxels that are now inside the band.
    ///
    /// A candidate is emitted only by its lowest-index active neighbor, so each
    /// new voxel is appended exactly once. Overflowing the capacity triggers a
    /// full rebuild instead.
    pub fn add(&mut self, field: &LevelSetField) -> Result<(), SolverError> {
        let dims = field.dims;
        let layers = self.layers;
        let member = &self.member;
        let fresh: Vec<usize> = expand(&self.indices, self.stride, |&i, sink| {
            for n in dims.face_neighbors(i) {
                if member[n] || field.distance[n].abs() > layers {
                    continue;
                }
                let owner = dims.face_neighbors(n).filter(|&m| member[m]).min();
                if owner == Some(i) {
                    sink(n);
                }
            }
        });

        if fresh.is_empty() {
            return Ok(());
        }
        if self.indices.len() + fresh.len() > self.capacity {
            log::debug!(
                "Narrow band overflow ({} + {} > {}), rebuilding",
                self.indices.len(),
                fresh.len(),
                self.capacity
            );
            return self.rebuild(field);
        }
        for &n in &fresh {
            self.member[n] = true;
        }
        self.indices.extend_from_slice(&fresh);
        Ok(())
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Reserved list size; appends beyond it force a rebuild.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn contains(&self, i: usize) -> bool {
        self.member[i]
    }

    /// Number of full rebuilds so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::GridDims;
    use std::collections::HashSet;

    fn disk_field(dims: GridDims, r: f32, layers: usize) -> LevelSetField {
        let (cx, cy) = (dims.width as f32 / 2.0, dims.height as f32 / 2.0);
        let labels = (0..dims.len())
            .map(|i| {
                let (x, y, _) = dims.coords(i);
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                u32::from(dx * dx + dy * dy <= r * r)
            })
            .collect();
        LevelSetField::from_labels(dims, labels, layers).unwrap()
    }

    fn expected_band(field: &LevelSetField, layers: usize) -> HashSet<usize> {
        (0..field.dims.len())
            .filter(|&i| field.distance[i].abs() <= layers as f32)
            .collect()
    }

    fn assert_matches_band(band: &NarrowBand, field: &LevelSetField, layers: usize) {
        let listed: HashSet<usize> = band.indices().iter().copied().collect();
        assert_eq!(listed.len(), band.len(), "duplicate entries in active list");
        assert_eq!(listed, expected_band(field, layers));
        for i in 0..field.dims.len() {
            assert_eq!(band.contains(i), listed.contains(&i), "membership mask at {}", i);
        }
    }

    #[test]
    fn test_rebuild_matches_band() {
        let dims = GridDims::new_2d(48, 40);
        let field = disk_field(dims, 10.0, 3);
        let mut band = NarrowBand::new(dims.len(), 3, 17, dims.len());
        band.rebuild(&field).unwrap();

        assert_matches_band(&band, &field, 3);
        assert!(band.indices().windows(2).all(|w| w[0] < w[1]));
        assert!(band.capacity() >= band.len());
        assert!(band.capacity() >= dims.len() / 10);
        assert_eq!(band.rebuilds(), 1);
    }

    #[test]
    fn test_rebuild_budget_exhausted() {
        let dims = GridDims::new_2d(32, 32);
        let field = disk_field(dims, 8.0, 3);
        let mut band = NarrowBand::new(dims.len(), 3, 64, 10);
        let result = band.rebuild(&field);
        assert!(matches!(
            result,
            Err(SolverError::ResourceExhausted { budget: 10, .. })
        ));
    }

    #[test]
    fn test_delete_then_add_tracks_shrunk_square() {
        let dims = GridDims::new_2d(40, 40);
        let square = |lo: usize, hi: usize| {
            let labels = (0..dims.len())
                .map(|i| {
                    let (x, y, _) = dims.coords(i);
                    u32::from((lo..hi).contains(&x) && (lo..hi).contains(&y))
                })
                .collect();
            LevelSetField::from_labels(dims, labels, 3).unwrap()
        };
        let mut field = square(10, 30);
        let mut band = NarrowBand::new(dims.len(), 3, 32, dims.len());
        band.rebuild(&field).unwrap();

        // Shrink by one voxel per side: every layer moves inward by one hop.
        field = square(11, 29);
        band.delete(&field, |_| false);
        band.add(&field).unwrap();

        assert_matches_band(&band, &field, 3);
        assert_eq!(band.rebuilds(), 1);
    }

    #[test]
    fn test_delete_keeps_flagged_entries() {
        let dims = GridDims::new_2d(32, 32);
        let mut field = disk_field(dims, 8.0, 2);
        let mut band = NarrowBand::new(dims.len(), 2, 16, dims.len());
        band.rebuild(&field).unwrap();
        let before = band.len();

        for d in field.distance.iter_mut() {
            *d = d.signum() * 3.0;
        }
        let pinned = band.indices()[0];
        band.delete(&field, |i| i == pinned);

        assert_eq!(band.indices(), &[pinned]);
        assert!(before > 1);
        assert!(band.contains(pinned));
    }

    #[test]
    fn test_add_overflow_falls_back_to_rebuild() {
        let dims = GridDims::new_2d(40, 40);
        let mut field = LevelSetField::from_labels(dims, vec![0; dims.len()], 2).unwrap();
        // Sparse lattice of band voxels, three apart.
        for i in 0..dims.len() {
            let (x, y, _) = dims.coords(i);
            if x % 3 == 0 && y % 3 == 0 {
                field.distance[i] = 0.5;
            }
        }
        let mut band = NarrowBand::new(dims.len(), 2, 8, dims.len());
        band.rebuild(&field).unwrap();
        let capacity = band.capacity();

        // Every voxel joins the band; the one-hop ring alone overflows.
        for d in field.distance.iter_mut() {
            *d = d.min(1.5);
        }
        band.add(&field).unwrap();

        assert!(dims.len() > capacity);
        assert_eq!(band.rebuilds(), 2);
        assert_matches_band(&band, &field, 2);
    }

    #[test]
    fn test_add_reaches_one_hop_only() {
        let dims = GridDims::new_2d(16, 16);
        let mut field = LevelSetField::from_labels(dims, vec![0; dims.len()], 2).unwrap();
        let seed = dims.idx(8, 8, 0);
        field.distance[seed] = 0.5;
        let mut band = NarrowBand::new(dims.len(), 2, 4, dims.len());
        band.rebuild(&field).unwrap();
        assert_eq!(band.indices(), &[seed]);

        // Two voxels enter the band: one adjacent, one two hops away.
        let near = dims.idx(9, 8, 0);
        let far = dims.idx(10, 8, 0);
        field.distance[near] = 1.5;
        field.distance[far] = 2.0;

        band.add(&field).unwrap();
        assert!(band.contains(near));
        assert!(!band.contains(far));
        band.add(&field).unwrap();
        assert!(band.contains(far));
        assert_eq!(band.len(), 3);
    }
}
