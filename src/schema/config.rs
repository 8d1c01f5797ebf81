//! Configuration types for narrow-band level-set evolution.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compute::{ConnectivityRule, LabelMode};

/// Largest object id accepted in exclusive-label mode.
pub const MAX_EXCLUSIVE_LABEL: u32 = 255;

/// Deepest narrow band accepted by `validate()`.
pub const MAX_NARROW_BAND_LAYERS: usize = 16;

/// Number of objects representable in overlap (bitmask) mode.
pub const MAX_OVERLAP_OBJECTS: usize = 32;

/// Top-level solver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Number of distance layers kept on each side of the front (L).
    pub narrow_band_layers: usize,
    /// Iteration budget for `solve()`.
    pub max_iterations: u64,
    /// Progress callback period, in iterations.
    pub resampling_interval: u64,
    /// Physical size of one voxel; scales the stable step.
    pub voxel_spacing: f32,
    /// Exclusive object ids or overlapping bitmask labels.
    pub label_mode: LabelMode,
    /// Force term weights.
    pub weights: ForceWeights,
    /// Reject label flips that would change digital topology.
    pub topology_preservation: bool,
    /// Adjacency pair used for topology preservation.
    pub connectivity: ConnectivityRule,
    /// Use a fixed half-voxel step instead of the reduced stable step.
    pub clamp_speed: bool,
    /// Restrict band deletion to regions that changed recently.
    pub adaptive_convergence: bool,
    /// Iterations between label snapshots for adaptive convergence.
    pub sampling_interval: u64,
    /// Dilation cycles applied to the change mask.
    pub dilation_cycles: usize,
    /// Replace the fixed pressure target with region intensity fitting.
    pub intensity_estimation: bool,
    /// Iterations between region statistics refreshes.
    pub estimation_interval: u64,
    /// Squared speed below which an iteration counts as converged.
    pub convergence_threshold: f32,
    /// Chunk size for count/scan/compact passes.
    pub chunk_stride: usize,
    /// Hard cap on the active list size (None = whole grid).
    pub max_active_voxels: Option<usize>,
    /// Worker threads for the solver pool (0 = rayon default).
    pub threads: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            narrow_band_layers: 3,
            max_iterations: 100,
            resampling_interval: 10,
            voxel_spacing: 1.0,
            label_mode: LabelMode::Exclusive,
            weights: ForceWeights::default(),
            topology_preservation: false,
            connectivity: ConnectivityRule::EightFour,
            clamp_speed: false,
            adaptive_convergence: false,
            sampling_interval: 5,
            dilation_cycles: 3,
            intensity_estimation: false,
            estimation_interval: 5,
            convergence_threshold: 1e-12,
            chunk_stride: 128,
            max_active_voxels: None,
            threads: 0,
        }
    }
}

/// Weights of the individual speed terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceWeights {
    /// Pressure (balloon or image) weight.
    pub pressure: f32,
    /// Curvature regularization weight.
    pub curvature: f32,
    /// External vector field weight.
    pub vector_field: f32,
    /// Pressure image value treated as the zero-speed level.
    pub target_pressure: f32,
}

impl Default for ForceWeights {
    fn default() -> Self {
        Self {
            pressure: 1.0,
            curvature: 0.1,
            vector_field: 0.0,
            target_pressure: 0.5,
        }
    }
}

impl ForceWeights {
    /// All weights zero: the evolution is a no-op.
    pub fn zero() -> Self {
        Self {
            pressure: 0.0,
            curvature: 0.0,
            vector_field: 0.0,
            target_pressure: 0.0,
        }
    }
}

impl SolverConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Clamp value for the distance field (L + 1).
    #[inline]
    pub fn distance_limit(&self) -> f32 {
        (self.narrow_band_layers + 1) as f32
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_NARROW_BAND_LAYERS).contains(&self.narrow_band_layers) {
            return Err(ConfigError::InvalidLayers(self.narrow_band_layers));
        }
        if self.resampling_interval == 0 {
            return Err(ConfigError::ZeroInterval("resampling_interval"));
        }
        if self.adaptive_convergence && self.sampling_interval == 0 {
            return Err(ConfigError::ZeroInterval("sampling_interval"));
        }
        if self.intensity_estimation && self.estimation_interval == 0 {
            return Err(ConfigError::ZeroInterval("estimation_interval"));
        }
        if !(self.voxel_spacing.is_finite() && self.voxel_spacing > 0.0) {
            return Err(ConfigError::InvalidSpacing(self.voxel_spacing));
        }
        if self.chunk_stride == 0 {
            return Err(ConfigError::InvalidStride);
        }
        let w = &self.weights;
        for (name, value) in [
            ("pressure", w.pressure),
            ("curvature", w.curvature),
            ("vector_field", w.vector_field),
            ("target_pressure", w.target_pressure),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidWeight(name));
            }
        }
        if self.convergence_threshold.is_nan() || self.convergence_threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Narrow band needs 2..=16 layers, got {0}")]
    InvalidLayers(usize),
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
    #[error("Voxel spacing must be positive and finite, got {0}")]
    InvalidSpacing(f32),
    #[error("Chunk stride must be non-zero")]
    InvalidStride,
    #[error("Weight {0} is not finite")]
    InvalidWeight(&'static str),
    #[error("Convergence threshold must be non-negative")]
    InvalidThreshold,
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
