//! Seed types for initial label maps and synthetic test images.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::compute::{GridDims, LabelMode};

/// Complete seed specification for a segmentation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    /// Initial object labels.
    pub pattern: Pattern,
    /// Synthetic pressure image (None = balloon force).
    #[serde(default)]
    pub image: Option<ImagePattern>,
}

impl Default for Seed {
    fn default() -> Self {
        Self {
            pattern: Pattern::MultiSphere {
                spheres: vec![
                    SphereSpec {
                        center: (0.3, 0.5, 0.5),
                        radius: 0.05,
                        label: 1,
                    },
                    SphereSpec {
                        center: (0.7, 0.5, 0.5),
                        radius: 0.05,
                        label: 2,
                    },
                ],
            },
            image: Some(ImagePattern::Spheres {
                spheres: vec![
                    SphereSpec {
                        center: (0.3, 0.5, 0.5),
                        radius: 0.15,
                        label: 1,
                    },
                    SphereSpec {
                        center: (0.7, 0.5, 0.5),
                        radius: 0.15,
                        label: 1,
                    },
                ],
                inside: 1.0,
                outside: 0.0,
                noise: 0.05,
                seed: 42,
            }),
        }
    }
}

/// Label patterns. Positions and radii are fractions of the grid size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Pattern {
    /// Single ball (disk in 2D).
    Sphere {
        center: (f32, f32, f32),
        radius: f32,
        label: u32,
    },
    /// Several balls, painted in order.
    MultiSphere { spheres: Vec<SphereSpec> },
    /// Axis-aligned box between two corners.
    Box {
        min: (f32, f32, f32),
        max: (f32, f32, f32),
        label: u32,
    },
    /// Explicit voxels as (x, y, z, label).
    Custom { voxels: Vec<(usize, usize, usize, u32)> },
}

/// One ball of a multi-sphere pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphereSpec {
    pub center: (f32, f32, f32),
    pub radius: f32,
    pub label: u32,
}

/// Synthetic scalar images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImagePattern {
    /// `inside` within any sphere, `outside` elsewhere, plus Gaussian noise.
    Spheres {
        spheres: Vec<SphereSpec>,
        inside: f32,
        outside: f32,
        /// Noise standard deviation (0 = clean image).
        noise: f32,
        seed: u64,
    },
}

impl Seed {
    /// Generate the initial label map.
    ///
    /// Exclusive mode writes the label id; overlap mode sets bit `label`.
    pub fn generate_labels(&self, dims: GridDims, mode: LabelMode) -> Vec<u32> {
        let mut labels = vec![0u32; dims.len()];
        let mut paint = |i: usize, label: u32| match mode {
            LabelMode::Exclusive => labels[i] = label,
            LabelMode::Overlap => labels[i] |= 1u32.checked_shl(label).unwrap_or(0),
        };

        match &self.pattern {
            Pattern::Sphere {
                center,
                radius,
                label,
            } => {
                for i in sphere_voxels(dims, *center, *radius) {
                    paint(i, *label);
                }
            }
            Pattern::MultiSphere { spheres } => {
                for sphere in spheres {
                    for i in sphere_voxels(dims, sphere.center, sphere.radius) {
                        paint(i, sphere.label);
                    }
                }
            }
            Pattern::Box { min, max, label } => {
                let lo = to_voxel(dims, *min);
                let hi = to_voxel(dims, *max);
                for i in 0..dims.len() {
                    let (x, y, z) = dims.coords(i);
                    let p = (x as f32, y as f32, z as f32);
                    let inside = (lo.0..=hi.0).contains(&p.0)
                        && (lo.1..=hi.1).contains(&p.1)
                        && (!dims.is_3d() || (lo.2..=hi.2).contains(&p.2));
                    if inside {
                        paint(i, *label);
                    }
                }
            }
            Pattern::Custom { voxels } => {
                for &(x, y, z, label) in voxels {
                    if x < dims.width && y < dims.height && z < dims.depth {
                        paint(dims.idx(x, y, z), label);
                    }
                }
            }
        }

        labels
    }

    /// Generate the synthetic pressure image, if any.
    pub fn generate_image(&self, dims: GridDims) -> Option<Vec<f32>> {
        self.image.as_ref().map(|pattern| pattern.generate(dims))
    }
}

impl ImagePattern {
    pub fn generate(&self, dims: GridDims) -> Vec<f32> {
        match self {
            ImagePattern::Spheres {
                spheres,
                inside,
                outside,
                noise,
                seed,
            } => {
                let mut image = vec![*outside; dims.len()];
                for sphere in spheres {
                    for i in sphere_voxels(dims, sphere.center, sphere.radius) {
                        image[i] = *inside;
                    }
                }
                if *noise > 0.0 {
                    let mut rng = StdRng::seed_from_u64(*seed);
                    for value in &mut image {
                        let sample: f32 = rng.sample(rand_distr::StandardNormal);
                        *value += noise * sample;
                    }
                }
                image
            }
        }
    }
}

/// Fractional position to voxel coordinates.
fn to_voxel(dims: GridDims, p: (f32, f32, f32)) -> (f32, f32, f32) {
    (
        p.0 * dims.width as f32,
        p.1 * dims.height as f32,
        p.2 * dims.depth as f32,
    )
}

fn sphere_voxels(dims: GridDims, center: (f32, f32, f32), radius: f32) -> Vec<usize> {
    let c = to_voxel(dims, center);
    let min_dim = if dims.is_3d() {
        dims.width.min(dims.height).min(dims.depth)
    } else {
        dims.width.min(dims.height)
    };
    let r = radius * min_dim as f32;
    let r_sq = r * r;

    (0..dims.len())
        .filter(|&i| {
            let (x, y, z) = dims.coords(i);
            let dx = x as f32 - c.0;
            let dy = y as f32 - c.1;
            let dz = if dims.is_3d() { z as f32 - c.2 } else { 0.0 };
            dx * dx + dy * dy + dz * dz <= r_sq
        })
        .collect()
}
