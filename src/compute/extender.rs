//! Bounded distance re-extension through the narrow band layers.
//!
//! Front voxels keep the values written by the force applier. Every other band
//! voxel is re-derived layer by layer as `min(|d| of resolved neighbors) + 1`,
//! which is a graph-distance approximation that only holds for thin bands.
//! Values beyond the last layer are stored as exactly `L + 1`, so the contents
//! of out-of-band voxels do not depend on which of them were revisited.

use rayon::prelude::*;

use super::LevelSetField;

/// Largest magnitude kept on a front voxel.
const FRONT_LIMIT: f32 = 1.0;

/// Layered min-plus-one relaxation starting from the front.
pub struct DistanceExtender {
    layers: usize,
    limit: f32,
    /// Voxel is resolved for the current epoch when `stamps[i] == epoch`.
    stamps: Vec<u32>,
    epoch: u32,
}

impl DistanceExtender {
    /// Create an extender for a grid of `len` voxels and `layers` band layers.
    pub fn new(len: usize, layers: usize) -> Self {
        Self {
            layers,
            limit: (layers + 1) as f32,
            stamps: vec![0; len],
            epoch: 0,
        }
    }

    /// Repair the band around `active`. Returns every index whose distance was
    /// rewritten, inside or outside of `active`.
    pub fn extend(&mut self, field: &mut LevelSetField, active: &[usize]) -> Vec<usize> {
        self.advance_epoch();
        let seeds: Vec<usize> = {
            let view = &*field;
            active
                .par_iter()
                .copied()
                .filter(|&i| view.is_front(i))
                .collect()
        };
        let mut written = self.propagate(field, seeds);
        self.reset_unresolved(field, active.iter().copied(), &mut written);
        written
    }

    /// Rebuild the whole grid from its front voxels.
    pub fn extend_full(&mut self, field: &mut LevelSetField) -> Vec<usize> {
        self.advance_epoch();
        let seeds: Vec<usize> = {
            let view = &*field;
            (0..view.dims.len())
                .into_par_iter()
                .filter(|&i| view.is_front(i))
                .collect()
        };
        let len = field.dims.len();
        let mut written = self.propagate(field, seeds);
        self.reset_unresolved(field, 0..len, &mut written);
        written
    }

    fn advance_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.stamps.fill(0);
            self.epoch = 1;
        }
    }

    fn propagate(&mut self, field: &mut LevelSetField, seeds: Vec<usize>) -> Vec<usize> {
        let epoch = self.epoch;
        let dims = field.dims;
        let mut written = Vec::new();

        for &i in &seeds {
            self.stamps[i] = epoch;
            let magnitude = field.distance[i].abs().min(FRONT_LIMIT);
            let value = LevelSetField::signed(field.labels[i], magnitude);
            if value.to_bits() != field.distance[i].to_bits() {
                field.distance[i] = value;
                written.push(i);
            }
        }

        let mut frontier = seeds;
        for _layer in 1..=self.layers {
            if frontier.is_empty() {
                break;
            }

            let mut reached: Vec<(usize, f32)> = {
                let stamps = &self.stamps;
                let distance = &field.distance;
                frontier
                    .par_iter()
                    .flat_map_iter(|&i| {
                        let next = distance[i].abs() + 1.0;
                        dims.face_neighbors(i)
                            .filter(move |&n| stamps[n] != epoch)
                            .map(move |n| (n, next))
                    })
                    .collect()
            };

            // Lowest candidate per voxel wins.
            reached.par_sort_unstable_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
            reached.dedup_by_key(|entry| entry.0);

            frontier = Vec::with_capacity(reached.len());
            for (n, magnitude) in reached {
                self.stamps[n] = epoch;
                // Anything past the last layer snaps to the clamp value.
                let magnitude = if magnitude > self.layers as f32 {
                    self.limit
                } else {
                    magnitude
                };
                let value = LevelSetField::signed(field.labels[n], magnitude);
                if value.to_bits() != field.distance[n].to_bits() {
                    field.distance[n] = value;
                    written.push(n);
                }
                frontier.push(n);
            }
        }

        written
    }

    fn reset_unresolved(
        &self,
        field: &mut LevelSetField,
        candidates: impl Iterator<Item = usize>,
        written: &mut Vec<usize>,
    ) {
        for i in candidates {
            if self.stamps[i] == self.epoch {
                continue;
            }
            let value = LevelSetField::signed(field.labels[i], self.limit);
            if value.to_bits() != field.distance[i].to_bits() {
                field.distance[i] = value;
                written.push(i);
            }
        }
    }
}
