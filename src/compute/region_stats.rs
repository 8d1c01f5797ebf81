//! Per-label intensity statistics for the region-fitting force.

use rayon::prelude::*;

use super::{LabelMode, LevelSetField};
use crate::schema::{MAX_EXCLUSIVE_LABEL, MAX_OVERLAP_OBJECTS};

/// Mean, voxel count and variance of one region.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionStat {
    pub mean: f32,
    pub area: usize,
    pub variance: f32,
}

/// Statistics for the background and every object slot.
///
/// Exclusive mode has one slot per object id (slot 0 is the background).
/// Overlap mode uses slot 0 for voxels with an empty mask and slot `k + 1`
/// for bit `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStats {
    mode: LabelMode,
    slots: Vec<RegionStat>,
}

impl RegionStats {
    pub fn background(&self) -> RegionStat {
        self.slots.first().copied().unwrap_or_default()
    }

    pub fn object(&self, object: u32) -> RegionStat {
        let slot = match self.mode {
            LabelMode::Exclusive => object as usize,
            LabelMode::Overlap => object as usize + 1,
        };
        self.slots.get(slot).copied().unwrap_or_default()
    }

    pub fn slots(&self) -> &[RegionStat] {
        &self.slots
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Partial {
    sum: f64,
    sum_sq: f64,
    count: usize,
}

impl Partial {
    #[inline]
    fn push(&mut self, value: f32) {
        let v = value as f64;
        self.sum += v;
        self.sum_sq += v * v;
        self.count += 1;
    }
}

/// Two-pass label-keyed reduction: per-slice partials, then a per-slot merge.
#[derive(Debug, Clone)]
pub struct RegionStatsEstimator {
    mode: LabelMode,
    slots: usize,
}

impl RegionStatsEstimator {
    pub fn new(mode: LabelMode) -> Self {
        let slots = match mode {
            LabelMode::Exclusive => MAX_EXCLUSIVE_LABEL as usize + 1,
            LabelMode::Overlap => MAX_OVERLAP_OBJECTS + 1,
        };
        Self { mode, slots }
    }

    pub fn estimate(&self, field: &LevelSetField, image: &[f32]) -> RegionStats {
        let dims = field.dims;
        // Rows in 2D, z-slices in 3D.
        let slice = if dims.is_3d() {
            dims.width * dims.height
        } else {
            dims.width
        }
        .max(1);
        let slots = self.slots;
        let mode = self.mode;

        let partials: Vec<Vec<Partial>> = image
            .par_chunks(slice)
            .zip(field.labels.par_chunks(slice))
            .map(|(values, labels)| {
                let mut acc = vec![Partial::default(); slots];
                for (&value, &label) in values.iter().zip(labels) {
                    match mode {
                        LabelMode::Exclusive => {
                            if let Some(p) = acc.get_mut(label as usize) {
                                p.push(value);
                            }
                        }
                        LabelMode::Overlap if label == 0 => acc[0].push(value),
                        LabelMode::Overlap => {
                            let mut bits = label;
                            while bits != 0 {
                                let k = bits.trailing_zeros() as usize;
                                bits &= bits - 1;
                                if let Some(p) = acc.get_mut(k + 1) {
                                    p.push(value);
                                }
                            }
                        }
                    }
                }
                acc
            })
            .collect();

        let stats = (0..slots)
            .into_par_iter()
            .map(|s| {
                let total = partials.iter().fold(Partial::default(), |mut t, p| {
                    t.sum += p[s].sum;
                    t.sum_sq += p[s].sum_sq;
                    t.count += p[s].count;
                    t
                });
                if total.count == 0 {
                    return RegionStat::default();
                }
                let n = total.count as f64;
                let mean = total.sum / n;
                let variance = (total.sum_sq / n - mean * mean).max(0.0);
                RegionStat {
                    mean: mean as f32,
                    area: total.count,
                    variance: variance as f32,
                }
            })
            .collect();

        RegionStats {
            mode,
            slots: stats,
        }
    }
}
