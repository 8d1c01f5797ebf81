//! Commits pending speeds to the scratch field in parity-ordered sub-passes.
//!
//! Voxels of one parity class are never inside each other's 3x3(x3)
//! neighborhood, so every flip within a sub-pass can be certified on its own
//! against the topology table. Each sub-pass computes all outcomes in parallel
//! from the old distances and the scratch labels (which already hold earlier
//! sub-passes' flips), then scatters them serially.

use std::sync::Arc;

use rayon::prelude::*;

use super::forces::{NO_OBJECT, majority_label};
use super::topology::{ConnectivityRule, TopologyLut, neighborhood_code};
use super::{DeltaBuffer, ForceIndexMap, LabelMode, LevelSetField, StepScale};

/// Simple-point tables for object labels and for the background.
#[derive(Debug, Clone)]
pub struct TopologyGuard {
    rule: ConnectivityRule,
    objects: Arc<TopologyLut>,
    background: Arc<TopologyLut>,
}

impl TopologyGuard {
    /// Guard backed by the process-wide tables of `rule` and its dual.
    pub fn shared(rule: ConnectivityRule) -> Self {
        Self::with_tables(
            TopologyLut::shared(rule),
            TopologyLut::shared(rule.dual()),
        )
    }

    /// Guard from explicit tables (e.g. loaded from packed assets).
    pub fn with_tables(objects: Arc<TopologyLut>, background: Arc<TopologyLut>) -> Self {
        Self {
            rule: objects.rule(),
            objects,
            background,
        }
    }

    pub fn rule(&self) -> ConnectivityRule {
        self.rule
    }

    /// Whether voxel `i` can enter or leave exclusive label `label`.
    fn preserves_label(&self, field: &LevelSetField, i: usize, label: u32) -> bool {
        let (lut, rule) = if label == 0 {
            (&self.background, self.rule.dual())
        } else {
            (&self.objects, self.rule)
        };
        let code = neighborhood_code(field.dims, &field.labels, i, rule, |l| l == label);
        lut.is_simple(code)
    }

    /// Whether voxel `i` can toggle overlap bit `bit`.
    fn preserves_bit(&self, field: &LevelSetField, i: usize, bit: u32) -> bool {
        let code = neighborhood_code(field.dims, &field.labels, i, self.rule, |l| {
            l & (1 << bit) != 0
        });
        self.objects.is_simple(code)
    }
}

/// Summary of one application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Any distance or label value was rewritten.
    pub changed: bool,
    /// Accepted label flips.
    pub flips: usize,
    /// Flips refused by the topology guard.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    index: usize,
    distance: f32,
    label: u32,
    flips: u32,
    rejected: u32,
}

impl Outcome {
    fn keep(field: &LevelSetField, index: usize) -> Self {
        Self {
            index,
            distance: field.distance[index],
            label: field.labels[index],
            flips: 0,
            rejected: 0,
        }
    }
}

/// Parity-ordered, optionally topology-preserving force application.
pub struct TopologySafeApplier {
    mode: LabelMode,
    map: ForceIndexMap,
    guard: Option<TopologyGuard>,
    classes: Vec<Vec<usize>>,
}

impl TopologySafeApplier {
    pub fn new(mode: LabelMode, map: ForceIndexMap, guard: Option<TopologyGuard>) -> Self {
        Self {
            mode,
            map,
            guard,
            classes: vec![Vec::new(); 8],
        }
    }

    /// Apply `deltas` (one row per entry of `active`) to `new`.
    ///
    /// `new` must equal `old` on every voxel at entry; `old` is never written.
    pub fn apply(
        &mut self,
        old: &LevelSetField,
        new: &mut LevelSetField,
        active: &[usize],
        deltas: &DeltaBuffer,
        scale: StepScale,
    ) -> ApplyReport {
        let dims = old.dims;
        for class in &mut self.classes {
            class.clear();
        }
        for (k, &i) in active.iter().enumerate() {
            self.classes[dims.parity(i)].push(k);
        }

        let mut report = ApplyReport::default();
        for class in 0..dims.parity_classes() {
            let outcomes: Vec<Outcome> = {
                let view = &*new;
                self.classes[class]
                    .par_iter()
                    .map(|&k| {
                        let speeds = deltas.speeds_of(k);
                        self.outcome(old, view, active[k], speeds, deltas.targets[k], scale)
                    })
                    .collect()
            };

            for o in outcomes {
                report.flips += o.flips as usize;
                report.rejected += o.rejected as usize;
                if o.distance.to_bits() != new.distance[o.index].to_bits()
                    || o.label != new.labels[o.index]
                {
                    new.distance[o.index] = o.distance;
                    new.labels[o.index] = o.label;
                    report.changed = true;
                }
            }
        }
        report
    }

    fn outcome(
        &self,
        old: &LevelSetField,
        new: &LevelSetField,
        i: usize,
        speeds: &[f32],
        target: u32,
        scale: StepScale,
    ) -> Outcome {
        match self.mode {
            LabelMode::Exclusive => self.exclusive_outcome(old, new, i, speeds[0], target, scale),
            LabelMode::Overlap => self.overlap_outcome(old, new, i, speeds, scale),
        }
    }

    fn exclusive_outcome(
        &self,
        old: &LevelSetField,
        new: &LevelSetField,
        i: usize,
        speed: f32,
        target: u32,
        scale: StepScale,
    ) -> Outcome {
        let mut out = Outcome::keep(new, i);
        let change = scale.change(speed);
        if target == NO_OBJECT || change == 0.0 {
            return out;
        }

        let label = new.labels[i];
        let phi = old.phi(i, target, self.mode) - change;
        let was_member = label == target;
        let is_member = phi < 0.0;

        let next = match (was_member, is_member) {
            (true, false) => majority_label(new, i, |l| l != target).unwrap_or(0),
            (false, true) => target,
            _ => label,
        };

        if next != label {
            if new.dims.is_boundary(i) {
                return out;
            }
            if let Some(guard) = &self.guard
                && !(guard.preserves_label(new, i, label) && guard.preserves_label(new, i, next))
            {
                out.rejected = 1;
                return out;
            }
            out.flips = 1;
        }

        out.label = next;
        out.distance = LevelSetField::signed(next, phi.abs());
        out
    }

    fn overlap_outcome(
        &self,
        old: &LevelSetField,
        new: &LevelSetField,
        i: usize,
        speeds: &[f32],
        scale: StepScale,
    ) -> Outcome {
        let mut out = Outcome::keep(new, i);
        if speeds.iter().all(|&s| scale.change(s) == 0.0) {
            return out;
        }

        let relevant = new
            .dims
            .face_neighbors(i)
            .fold(new.labels[i], |acc, n| acc | new.labels[n]);
        let mut mask = new.labels[i];
        let mut magnitude = f32::INFINITY;

        for (c, &speed) in speeds.iter().enumerate() {
            let Some(bit) = self.map.object(c) else {
                continue;
            };
            if relevant & (1 << bit) == 0 {
                continue;
            }
            let phi = old.phi(i, bit, self.mode);
            let moved = phi - scale.change(speed);
            let was_member = mask & (1 << bit) != 0;
            let is_member = moved < 0.0;

            let accepted = if was_member == is_member {
                true
            } else if new.dims.is_boundary(i) {
                false
            } else if let Some(guard) = &self.guard
                && !guard.preserves_bit(new, i, bit)
            {
                out.rejected += 1;
                false
            } else {
                mask ^= 1 << bit;
                out.flips += 1;
                true
            };

            let value = if accepted { moved } else { phi };
            magnitude = magnitude.min(value.abs());
        }

        if magnitude.is_finite() {
            out.label = mask;
            out.distance = LevelSetField::signed(mask, magnitude);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::GridDims;

    fn exclusive(guard: Option<ConnectivityRule>, labels: &[u32]) -> TopologySafeApplier {
        TopologySafeApplier::new(
            LabelMode::Exclusive,
            ForceIndexMap::from_labels(labels, LabelMode::Exclusive),
            guard.map(TopologyGuard::shared),
        )
    }

    fn single(speed: f32, target: u32) -> DeltaBuffer {
        DeltaBuffer {
            channels: 1,
            speeds: vec![speed],
            targets: vec![target],
        }
    }

    fn square_labels(dims: GridDims, lo: usize, hi: usize, label: u32) -> Vec<u32> {
        (0..dims.len())
            .map(|i| {
                let (x, y, _) = dims.coords(i);
                if (lo..hi).contains(&x) && (lo..hi).contains(&y) {
                    label
                } else {
                    0
                }
            })
            .collect()
    }

    #[test]
    fn test_background_voxel_joins_object() {
        let dims = GridDims::new_2d(16, 16);
        let labels = square_labels(dims, 6, 10, 1);
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let i = dims.idx(5, 7, 0);

        let mut applier = exclusive(None, &labels);
        let report = applier.apply(
            &old,
            &mut new,
            &[i],
            &single(1.0, 1),
            StepScale::Stable { dt: 1.0 },
        );

        assert_eq!(report, ApplyReport { changed: true, flips: 1, rejected: 0 });
        assert_eq!(new.labels[i], 1);
        assert_eq!(new.distance[i], -0.5);
        assert_eq!(old.labels[i], 0, "old buffer must not be written");
    }

    #[test]
    fn test_zero_change_writes_nothing() {
        let dims = GridDims::new_2d(16, 16);
        let labels = square_labels(dims, 6, 10, 1);
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let active: Vec<usize> = (0..dims.len()).collect();
        let deltas = DeltaBuffer {
            channels: 1,
            speeds: vec![0.0; dims.len()],
            targets: (0..dims.len()).map(|i| crate::compute::target_object(&old, i)).collect(),
        };

        let mut applier = exclusive(Some(ConnectivityRule::EightFour), &labels);
        let report = applier.apply(
            &old,
            &mut new,
            &active,
            &deltas,
            StepScale::Clamped { spacing: 1.0 },
        );
        assert!(!report.changed);
        assert_eq!(new, old);
    }

    #[test]
    fn test_boundary_voxel_never_flips() {
        let dims = GridDims::new_2d(8, 8);
        let mut labels = vec![0u32; dims.len()];
        labels[dims.idx(1, 3, 0)] = 1;
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let edge = dims.idx(0, 3, 0);

        let mut applier = exclusive(None, &labels);
        let report = applier.apply(
            &old,
            &mut new,
            &[edge],
            &single(5.0, 1),
            StepScale::Stable { dt: 1.0 },
        );
        assert_eq!(report.flips, 0);
        assert_eq!(new.labels[edge], 0);
        assert_eq!(new.distance[edge], old.distance[edge]);
    }

    #[test]
    fn test_bridge_flip_is_rejected() {
        let dims = GridDims::new_2d(12, 16);
        let mut labels = vec![0u32; dims.len()];
        for y in 3..13 {
            labels[dims.idx(5, y, 0)] = 1;
            labels[dims.idx(7, y, 0)] = 1;
        }
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let gap = dims.idx(6, 7, 0);

        let mut guarded = exclusive(Some(ConnectivityRule::EightFour), &labels);
        let mut new = old.clone();
        let report = guarded.apply(
            &old,
            &mut new,
            &[gap],
            &single(1.0, 1),
            StepScale::Stable { dt: 1.0 },
        );
        assert_eq!(report.rejected, 1);
        assert!(!report.changed);
        assert_eq!(new, old);

        let mut free = exclusive(None, &labels);
        let mut new = old.clone();
        let report = free.apply(
            &old,
            &mut new,
            &[gap],
            &single(1.0, 1),
            StepScale::Stable { dt: 1.0 },
        );
        assert_eq!(report.flips, 1);
        assert_eq!(new.labels[gap], 1);
    }

    #[test]
    fn test_leaving_voxel_takes_majority_neighbor() {
        let dims = GridDims::new_2d(16, 16);
        let mut labels = square_labels(dims, 6, 10, 1);
        for y in 6..10 {
            labels[dims.idx(5, y, 0)] = 2;
        }
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let i = dims.idx(6, 7, 0);

        let mut applier = exclusive(None, &labels);
        applier.apply(&old, &mut new, &[i], &single(-1.0, 1), StepScale::Stable { dt: 1.0 });
        assert_eq!(new.labels[i], 2);
        assert_eq!(new.distance[i], -0.5);
    }

    #[test]
    fn test_same_class_flips_see_earlier_classes() {
        // Two adjacent voxels of different parity both try to bridge the bars;
        // the second sub-pass must see the first flip and refuse.
        let dims = GridDims::new_2d(12, 16);
        let mut labels = vec![0u32; dims.len()];
        for y in 3..13 {
            labels[dims.idx(4, y, 0)] = 1;
            labels[dims.idx(7, y, 0)] = 1;
        }
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let a = dims.idx(5, 8, 0);
        let b = dims.idx(6, 8, 0);
        let deltas = DeltaBuffer {
            channels: 1,
            speeds: vec![1.0, 1.0],
            targets: vec![1, 1],
        };

        let mut applier = exclusive(Some(ConnectivityRule::EightFour), &labels);
        let report = applier.apply(&old, &mut new, &[a, b], &deltas, StepScale::Stable { dt: 1.0 });
        assert_eq!(report.flips, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(
            crate::compute::count_components(
                &new,
                1,
                LabelMode::Exclusive,
                ConnectivityRule::EightFour,
            ),
            2
        );
    }

    #[test]
    fn test_overlap_bit_joins_and_keeps_other_bits() {
        let dims = GridDims::new_2d(16, 16);
        let mut labels = square_labels(dims, 6, 10, 0b10);
        let i = dims.idx(5, 7, 0);
        labels[i] = 0b01;
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let map = ForceIndexMap::from_labels(&labels, LabelMode::Overlap);
        let deltas = DeltaBuffer {
            channels: map.channels(),
            speeds: vec![0.0, 1.0],
            targets: vec![NO_OBJECT],
        };

        let mut applier = TopologySafeApplier::new(LabelMode::Overlap, map, None);
        let report = applier.apply(&old, &mut new, &[i], &deltas, StepScale::Stable { dt: 1.0 });
        assert_eq!(report.flips, 1);
        assert_eq!(new.labels[i], 0b11);
        assert_eq!(new.distance[i], -0.5);
    }

    #[test]
    fn test_overlap_guard_rejects_bridge() {
        let dims = GridDims::new_2d(12, 16);
        let mut labels = vec![0u32; dims.len()];
        for y in 3..13 {
            labels[dims.idx(5, y, 0)] = 0b100;
            labels[dims.idx(7, y, 0)] = 0b100;
        }
        let gap = dims.idx(6, 7, 0);
        labels[gap] = 0b001;
        let old = LevelSetField::from_labels(dims, labels.clone(), 2).unwrap();
        let mut new = old.clone();
        let map = ForceIndexMap::from_labels(&labels, LabelMode::Overlap);
        let deltas = DeltaBuffer {
            channels: map.channels(),
            speeds: vec![0.0, 1.0],
            targets: vec![NO_OBJECT],
        };

        let mut applier = TopologySafeApplier::new(
            LabelMode::Overlap,
            map,
            Some(TopologyGuard::shared(ConnectivityRule::EightFour)),
        );
        let report = applier.apply(&old, &mut new, &[gap], &deltas, StepScale::Stable { dt: 1.0 });
        assert_eq!(report.rejected, 1);
        assert_eq!(new.labels[gap], 0b001);
    }
}
