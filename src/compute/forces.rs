//! Speed evaluation over the active list.
//!
//! The speed of an object's front at a voxel is the sum of independent force
//! terms. Positive speed grows the object: the applier updates
//! `phi' = phi - change(speed)`.

use rayon::prelude::*;

use super::{LabelMode, LevelSetField, RegionStats};
use crate::schema::MAX_OVERLAP_OBJECTS;

/// Target marker for active voxels with no object to move.
pub const NO_OBJECT: u32 = u32::MAX;

/// Gradients below this squared norm contribute no curvature.
const DEGENERATE_GRADIENT: f32 = 1e-8;

/// One object's level set around one voxel.
pub struct Probe<'a> {
    pub field: &'a LevelSetField,
    pub mode: LabelMode,
    pub index: usize,
    pub object: u32,
    pub stats: Option<&'a RegionStats>,
}

impl Probe<'_> {
    #[inline]
    fn phi_at(&self, dx: i32, dy: i32, dz: i32) -> f32 {
        let j = self.field.dims.clamped(self.index, dx, dy, dz);
        self.field.phi(j, self.object, self.mode)
    }

    /// Central-difference gradient of `phi_o`.
    pub fn gradient(&self) -> [f32; 3] {
        [
            0.5 * (self.phi_at(1, 0, 0) - self.phi_at(-1, 0, 0)),
            0.5 * (self.phi_at(0, 1, 0) - self.phi_at(0, -1, 0)),
            0.5 * (self.phi_at(0, 0, 1) - self.phi_at(0, 0, -1)),
        ]
    }

    /// Mean curvature of `phi_o`, clamped to [-1, 1]. Zero on degenerate gradients.
    pub fn curvature(&self) -> f32 {
        let c = self.phi_at(0, 0, 0);
        let [gx, gy, gz] = self.gradient();
        let grad2 = gx * gx + gy * gy + gz * gz;
        if !grad2.is_finite() || grad2 < DEGENERATE_GRADIENT {
            return 0.0;
        }

        let second = |dx, dy, dz| self.phi_at(dx, dy, dz) - 2.0 * c + self.phi_at(-dx, -dy, -dz);
        let mixed = |ax: (i32, i32, i32), bx: (i32, i32, i32)| {
            0.25 * (self.phi_at(ax.0 + bx.0, ax.1 + bx.1, ax.2 + bx.2)
                - self.phi_at(ax.0 - bx.0, ax.1 - bx.1, ax.2 - bx.2)
                - self.phi_at(-ax.0 + bx.0, -ax.1 + bx.1, -ax.2 + bx.2)
                + self.phi_at(-ax.0 - bx.0, -ax.1 - bx.1, -ax.2 - bx.2))
        };
        let (x, y, z) = ((1, 0, 0), (0, 1, 0), (0, 0, 1));
        let fxx = second(1, 0, 0);
        let fyy = second(0, 1, 0);
        let fzz = second(0, 0, 1);
        let fxy = mixed(x, y);
        let fxz = mixed(x, z);
        let fyz = mixed(y, z);

        let numerator = fxx * (gy * gy + gz * gz)
            + fyy * (gx * gx + gz * gz)
            + fzz * (gx * gx + gy * gy)
            - 2.0 * (gx * gy * fxy + gx * gz * fxz + gy * gz * fyz);
        let kappa = numerator / (grad2 * grad2.sqrt());
        if kappa.is_finite() {
            kappa.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// A single additive speed contribution.
pub trait ForceTerm: Send + Sync {
    fn speed(&self, probe: &Probe) -> f32;

    fn name(&self) -> &'static str;
}

/// Balloon force, or a rescaled pressure image.
pub struct PressureTerm {
    weight: f32,
    image: Option<Vec<f32>>,
}

impl PressureTerm {
    /// Constant outward pressure.
    pub fn balloon(weight: f32) -> Self {
        Self {
            weight,
            image: None,
        }
    }

    /// Pressure image shifted by `target`; positive and negative excursions are
    /// normalized separately by their own maxima.
    pub fn from_image(weight: f32, image: &[f32], target: f32) -> Self {
        let (pos_max, neg_max) = image
            .par_iter()
            .fold(
                || (0.0f32, 0.0f32),
                |(p, n), &v| {
                    let s = v - target;
                    (p.max(s), n.max(-s))
                },
            )
            .reduce(|| (0.0, 0.0), |a, b| (a.0.max(b.0), a.1.max(b.1)));

        let rescaled = image
            .par_iter()
            .map(|&v| {
                let s = v - target;
                if s > 0.0 && pos_max > 0.0 {
                    s / pos_max
                } else if s < 0.0 && neg_max > 0.0 {
                    s / neg_max
                } else {
                    0.0
                }
            })
            .collect();

        Self {
            weight,
            image: Some(rescaled),
        }
    }

    pub fn values(&self) -> Option<&[f32]> {
        self.image.as_deref()
    }
}

impl ForceTerm for PressureTerm {
    fn speed(&self, probe: &Probe) -> f32 {
        let pressure = self.image.as_ref().map_or(1.0, |p| p[probe.index]);
        self.weight * pressure
    }

    fn name(&self) -> &'static str {
        "pressure"
    }
}

/// Mean-curvature smoothing: convex fronts retract.
pub struct CurvatureTerm {
    weight: f32,
}

impl CurvatureTerm {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }
}

impl ForceTerm for CurvatureTerm {
    fn speed(&self, probe: &Probe) -> f32 {
        -self.weight * probe.curvature()
    }

    fn name(&self) -> &'static str {
        "curvature"
    }
}

/// Transport of the front along an external vector field.
pub struct VectorFieldTerm {
    weight: f32,
    components: usize,
    field: Vec<f32>,
}

impl VectorFieldTerm {
    /// `field` is interleaved per voxel with 2 or 3 components.
    pub fn new(weight: f32, components: usize, field: Vec<f32>) -> Self {
        Self {
            weight,
            components,
            field,
        }
    }
}

impl ForceTerm for VectorFieldTerm {
    fn speed(&self, probe: &Probe) -> f32 {
        let g = probe.gradient();
        let base = probe.index * self.components;
        let v = &self.field[base..base + self.components];
        let dot: f32 = v.iter().zip(g.iter()).map(|(a, b)| a * b).sum();
        self.weight * dot
    }

    fn name(&self) -> &'static str {
        "vector_field"
    }
}

/// Region-competition pressure from the latest region means.
pub struct IntensityFitTerm {
    weight: f32,
    image: Vec<f32>,
    inv_range2: f32,
}

impl IntensityFitTerm {
    pub fn new(weight: f32, image: Vec<f32>) -> Self {
        let (lo, hi) = image
            .par_iter()
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), &v| (lo.min(v), hi.max(v)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            );
        let range = hi - lo;
        let inv_range2 = if range.is_finite() && range > 0.0 {
            1.0 / (range * range)
        } else {
            1.0
        };
        Self {
            weight,
            image,
            inv_range2,
        }
    }
}

impl ForceTerm for IntensityFitTerm {
    fn speed(&self, probe: &Probe) -> f32 {
        let Some(stats) = probe.stats else {
            return 0.0;
        };
        let value = self.image[probe.index];
        let inside = value - stats.object(probe.object).mean;
        let outside = value - stats.background().mean;
        self.weight * (outside * outside - inside * inside) * self.inv_range2
    }

    fn name(&self) -> &'static str {
        "intensity_fit"
    }
}

/// Overlap-mode mapping from label bit to delta channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceIndexMap {
    channel_of_bit: [Option<u8>; MAX_OVERLAP_OBJECTS],
    objects: Vec<u32>,
}

impl ForceIndexMap {
    /// Exclusive mode uses one channel; overlap mode one per bit present in `labels`.
    pub fn from_labels(labels: &[u32], mode: LabelMode) -> Self {
        let mut map = Self {
            channel_of_bit: [None; MAX_OVERLAP_OBJECTS],
            objects: Vec::new(),
        };
        if mode == LabelMode::Exclusive {
            return map;
        }
        let present = labels.par_iter().copied().reduce(|| 0, |a, b| a | b);
        for bit in 0..MAX_OVERLAP_OBJECTS as u32 {
            if present & (1 << bit) != 0 {
                map.channel_of_bit[bit as usize] = Some(map.objects.len() as u8);
                map.objects.push(bit);
            }
        }
        map
    }

    /// Delta entries per active voxel.
    pub fn channels(&self) -> usize {
        self.objects.len().max(1)
    }

    pub fn channel(&self, bit: u32) -> Option<usize> {
        self.channel_of_bit
            .get(bit as usize)
            .copied()
            .flatten()
            .map(usize::from)
    }

    /// Object (bit) driven by a channel in overlap mode.
    pub fn object(&self, channel: usize) -> Option<u32> {
        self.objects.get(channel).copied()
    }
}

/// Per-active-voxel pending speeds.
#[derive(Debug, Clone, Default)]
pub struct DeltaBuffer {
    pub channels: usize,
    /// `speeds[k * channels + c]` for active entry `k`.
    pub speeds: Vec<f32>,
    /// Exclusive-mode object moved by entry `k`, or [`NO_OBJECT`].
    pub targets: Vec<u32>,
}

impl DeltaBuffer {
    #[inline]
    pub fn speeds_of(&self, k: usize) -> &[f32] {
        &self.speeds[k * self.channels..(k + 1) * self.channels]
    }
}

/// Exclusive-mode object that voxel `i` moves: its own, or the dominant
/// neighboring object for background voxels.
pub fn target_object(field: &LevelSetField, i: usize) -> u32 {
    let own = field.labels[i];
    if own != 0 {
        return own;
    }
    majority_label(field, i, |l| l != 0).unwrap_or(NO_OBJECT)
}

/// Most frequent face-neighbor label accepted by `filter`; ties go to the smaller label.
pub fn majority_label(
    field: &LevelSetField,
    i: usize,
    filter: impl Fn(u32) -> bool,
) -> Option<u32> {
    let mut seen: [(u32, u8); 6] = [(0, 0); 6];
    let mut distinct = 0;
    for n in field.dims.face_neighbors(i) {
        let label = field.labels[n];
        if !filter(label) {
            continue;
        }
        match seen[..distinct].iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 += 1,
            None => {
                seen[distinct] = (label, 1);
                distinct += 1;
            }
        }
    }
    seen[..distinct]
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|&(label, _)| label)
}

/// Composes force terms and fills the delta buffer.
pub struct ForceEvaluator {
    terms: Vec<Box<dyn ForceTerm>>,
    mode: LabelMode,
    map: ForceIndexMap,
    layers: f32,
}

impl ForceEvaluator {
    pub fn new(mode: LabelMode, map: ForceIndexMap, layers: usize) -> Self {
        Self {
            terms: Vec::new(),
            mode,
            map,
            layers: layers as f32,
        }
    }

    pub fn with_term(mut self, term: Box<dyn ForceTerm>) -> Self {
        self.terms.push(term);
        self
    }

    pub fn term_names(&self) -> Vec<&'static str> {
        self.terms.iter().map(|t| t.name()).collect()
    }

    fn speed(&self, probe: &Probe) -> f32 {
        let total: f32 = self.terms.iter().map(|t| t.speed(probe)).sum();
        if total.is_finite() { total } else { 0.0 }
    }

    /// Evaluate every active voxel. Reads only `field`; each entry is written once.
    pub fn evaluate(
        &self,
        field: &LevelSetField,
        active: &[usize],
        stats: Option<&RegionStats>,
        out: &mut DeltaBuffer,
    ) {
        let channels = self.map.channels();
        out.channels = channels;
        out.speeds.clear();
        out.speeds.resize(active.len() * channels, 0.0);
        out.targets.clear();
        out.targets.resize(active.len(), NO_OBJECT);

        let mode = self.mode;
        out.speeds
            .par_chunks_mut(channels)
            .zip(out.targets.par_iter_mut())
            .zip(active.par_iter())
            .for_each(|((speeds, target), &i)| {
                if field.distance[i].abs() > self.layers {
                    return;
                }
                match mode {
                    LabelMode::Exclusive => {
                        let object = target_object(field, i);
                        *target = object;
                        if object != NO_OBJECT {
                            speeds[0] = self.speed(&Probe {
                                field,
                                mode,
                                index: i,
                                object,
                                stats,
                            });
                        }
                    }
                    LabelMode::Overlap => {
                        let relevant = field
                            .dims
                            .face_neighbors(i)
                            .fold(field.labels[i], |acc, n| acc | field.labels[n]);
                        for (c, slot) in speeds.iter_mut().enumerate() {
                            let Some(object) = self.map.object(c) else {
                                continue;
                            };
                            if relevant & (1 << object) == 0 {
                                continue;
                            }
                            *slot = self.speed(&Probe {
                                field,
                                mode,
                                index: i,
                                object,
                                stats,
                            });
                        }
                    }
                }
            });
    }
}
