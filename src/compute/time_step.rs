//! Stable step size from the largest pending speed.

use rayon::prelude::*;

/// How a speed is turned into a level-set change for one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepScale {
    /// Fixed half-voxel step; speeds are clamped to [-1, 1].
    Clamped { spacing: f32 },
    /// Reduced step `dt` with `dt * max|speed| == 0.5 * spacing`.
    Stable { dt: f32 },
}

impl StepScale {
    /// Level-set change for a speed.
    #[inline]
    pub fn change(self, speed: f32) -> f32 {
        match self {
            StepScale::Clamped { spacing } => 0.5 * spacing * speed.clamp(-1.0, 1.0),
            StepScale::Stable { dt } => dt * speed,
        }
    }
}

/// Two-stage parallel max reduction over the delta buffer.
#[derive(Debug, Clone)]
pub struct TimeStepReducer {
    spacing: f32,
    threshold: f32,
    stride: usize,
}

impl TimeStepReducer {
    pub fn new(spacing: f32, threshold: f32, stride: usize) -> Self {
        Self {
            spacing,
            threshold,
            stride: stride.max(1),
        }
    }

    /// Largest squared speed. Stage 1 reduces each chunk, stage 2 the chunk maxima.
    pub fn max_squared(&self, deltas: &[f32]) -> f32 {
        let partial: Vec<f32> = deltas
            .par_chunks(self.stride)
            .map(|chunk| chunk.iter().fold(0.0f32, |m, &s| m.max(s * s)))
            .collect();
        partial.into_iter().fold(0.0, f32::max)
    }

    /// Step scale for this iteration, or `None` when every speed is negligible.
    pub fn reduce(&self, deltas: &[f32]) -> Option<StepScale> {
        let max = self.max_squared(deltas);
        if !(max >= self.threshold) || max == 0.0 {
            return None;
        }
        Some(StepScale::Stable {
            dt: 0.5 * self.spacing / max.sqrt(),
        })
    }
}
