//! Solver - drives narrow-band level-set evolution.
//!
//! One iteration runs the stages in a fixed order, each finishing before the
//! next starts: force evaluation, step reduction, topology-safe application,
//! distance re-extension, convergence sampling and active list maintenance.
//! Every stage reads the committed field and writes the scratch field; changed
//! entries are copied back at the end of the iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use super::topology::{ConnectivityRule, LutError, TopologyLut};
use super::{
    ConvergenceTracker, CurvatureTerm, DeltaBuffer, DistanceExtender, ForceEvaluator,
    ForceIndexMap, GridDims, IntensityFitTerm, LabelMode, LevelSetField, NarrowBand,
    PressureTerm, RegionStats, RegionStatsEstimator, StepScale, TimeStepReducer, TopologyGuard,
    TopologySafeApplier, VectorFieldTerm,
};
use crate::schema::{ConfigError, MAX_EXCLUSIVE_LABEL, MAX_NARROW_BAND_LAYERS, SolverConfig};

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&SolverProgress) + Send + Sync>;

/// Errors raised by solver construction and stepping.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("{field} has {actual} values, expected {expected}")]
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Connectivity {rule:?} does not apply to a {dimensions}D grid")]
    UnsupportedConnectivity {
        rule: ConnectivityRule,
        dimensions: usize,
    },
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Active list needs {requested} entries, budget is {budget}")]
    ResourceExhausted { requested: usize, budget: usize },
    #[error("Label {label} at voxel {index} is not valid in {mode:?} mode")]
    LabelOutOfRange {
        label: u32,
        index: usize,
        mode: LabelMode,
    },
    #[error("Distance at voxel {index} is not finite")]
    InvalidDistance { index: usize },
    #[error("Intensity estimation requires a pressure image")]
    MissingIntensity,
    #[error("Failed to create compute pool: {0}")]
    ComputeContext(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid topology table: {0}")]
    Lut(#[from] LutError),
}

/// Why `solve()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Iteration budget used up.
    MaxIterations,
    /// Every pending speed was negligible.
    Converged,
    /// No voxel left in the narrow band.
    EmptyBand,
    /// Cancelled through the cancel handle.
    Cancelled,
}

/// Progress snapshot passed to the callback.
#[derive(Debug, Clone, Serialize)]
pub struct SolverProgress {
    pub iteration: u64,
    pub max_iterations: u64,
    pub active_voxels: usize,
    /// Iterations per second since the previous report.
    pub rate: f64,
    pub elapsed_secs: f64,
}

/// Summary of a `solve()` run.
#[derive(Debug, Clone, Serialize)]
pub struct SolveReport {
    pub iterations: u64,
    pub stop_reason: StopReason,
    pub elapsed_secs: f64,
    pub iterations_per_second: f64,
    pub active_voxels: usize,
    pub flips: u64,
    pub rejected_flips: u64,
    pub band_rebuilds: u64,
}

/// Dense inputs of a segmentation run.
#[derive(Debug, Clone)]
pub struct SegmentationInput {
    pub dims: GridDims,
    pub distance: Vec<f32>,
    pub labels: Vec<u32>,
    /// Pressure image; also the intensity image for region fitting.
    pub pressure: Option<Vec<f32>>,
    /// Interleaved per-voxel vectors with 2 (2D) or 3 (3D) components.
    pub vector_field: Option<Vec<f32>>,
}

impl SegmentationInput {
    pub fn new(dims: GridDims, distance: Vec<f32>, labels: Vec<u32>) -> Self {
        Self {
            dims,
            distance,
            labels,
            pressure: None,
            vector_field: None,
        }
    }

    /// Inputs from a label map, with the distance derived deep enough for any
    /// supported band width.
    pub fn from_labels(dims: GridDims, labels: Vec<u32>) -> Result<Self, SolverError> {
        let field = LevelSetField::from_labels(dims, labels, MAX_NARROW_BAND_LAYERS)?;
        Ok(Self::new(dims, field.distance, field.labels))
    }

    pub fn with_pressure(mut self, pressure: Vec<f32>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn with_vector_field(mut self, vectors: Vec<f32>) -> Self {
        self.vector_field = Some(vectors);
        self
    }

    fn validate(&self, config: &SolverConfig) -> Result<(), SolverError> {
        let len = self.dims.len();
        let check = |field: &'static str, actual: usize, expected: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(SolverError::ShapeMismatch {
                    field,
                    expected,
                    actual,
                })
            }
        };
        check("distance", self.distance.len(), len)?;
        check("labels", self.labels.len(), len)?;
        if let Some(pressure) = &self.pressure {
            check("pressure", pressure.len(), len)?;
        }
        if let Some(vectors) = &self.vector_field {
            let components = if self.dims.is_3d() { 3 } else { 2 };
            check("vector_field", vectors.len(), len * components)?;
        }

        if config.topology_preservation && config.connectivity.is_3d() != self.dims.is_3d() {
            return Err(SolverError::UnsupportedConnectivity {
                rule: config.connectivity,
                dimensions: if self.dims.is_3d() { 3 } else { 2 },
            });
        }
        if config.intensity_estimation && self.pressure.is_none() {
            return Err(SolverError::MissingIntensity);
        }
        if config.label_mode == LabelMode::Exclusive
            && let Some(index) = self.labels.iter().position(|&l| l > MAX_EXCLUSIVE_LABEL)
        {
            return Err(SolverError::LabelOutOfRange {
                label: self.labels[index],
                index,
                mode: config.label_mode,
            });
        }
        if let Some(index) = self.distance.iter().position(|d| !d.is_finite()) {
            return Err(SolverError::InvalidDistance { index });
        }
        Ok(())
    }
}

/// Label areas and front size of a field.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationStats {
    /// `(object, voxel count)` for every non-empty object.
    pub object_areas: Vec<(u32, usize)>,
    /// Voxels inside any object.
    pub inside_voxels: usize,
    /// Voxels with a face neighbor of a different label.
    pub front_voxels: usize,
}

impl SegmentationStats {
    pub fn from_field(field: &LevelSetField, mode: LabelMode) -> Self {
        let bins = match mode {
            LabelMode::Exclusive => MAX_EXCLUSIVE_LABEL as usize + 1,
            LabelMode::Overlap => 32,
        };
        let histogram = field
            .labels
            .par_iter()
            .fold(
                || vec![0usize; bins],
                |mut acc, &label| {
                    match mode {
                        LabelMode::Exclusive => {
                            if let Some(slot) = acc.get_mut(label as usize) {
                                *slot += 1;
                            }
                        }
                        LabelMode::Overlap => {
                            let mut bits = label;
                            while bits != 0 {
                                acc[bits.trailing_zeros() as usize] += 1;
                                bits &= bits - 1;
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0usize; bins],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        let first = match mode {
            LabelMode::Exclusive => 1,
            LabelMode::Overlap => 0,
        };
        let object_areas = histogram
            .iter()
            .enumerate()
            .skip(first)
            .filter(|&(_, &n)| n > 0)
            .map(|(object, &n)| (object as u32, n))
            .collect();

        let inside_voxels = field.labels.par_iter().filter(|&&l| l != 0).count();
        let front_voxels = (0..field.dims.len())
            .into_par_iter()
            .filter(|&i| field.is_front(i))
            .count();

        Self {
            object_areas,
            inside_voxels,
            front_voxels,
        }
    }
}

/// Narrow-band active contour solver.
pub struct Solver {
    config: SolverConfig,
    pool: Arc<ThreadPool>,
    field: LevelSetField,
    scratch: LevelSetField,
    band: NarrowBand,
    forces: ForceEvaluator,
    deltas: DeltaBuffer,
    reducer: TimeStepReducer,
    applier: TopologySafeApplier,
    extender: DistanceExtender,
    tracker: Option<ConvergenceTracker>,
    estimator: Option<(RegionStatsEstimator, Vec<f32>)>,
    stats: Option<RegionStats>,
    iteration: u64,
    terminal: Option<StopReason>,
    cancelled: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
    flips: u64,
    rejected: u64,
    started: Option<Instant>,
    last_report: Option<(Instant, u64)>,
}

impl Solver {
    /// Validate inputs and build the initial band.
    pub fn new(input: SegmentationInput, config: SolverConfig) -> Result<Self, SolverError> {
        Self::build(input, config, |config: &SolverConfig| {
            Ok(config
                .topology_preservation
                .then(|| TopologyGuard::shared(config.connectivity)))
        })
    }

    /// Like [`Solver::new`], with topology tables loaded from packed bitsets
    /// for the configured rule and its dual.
    pub fn with_topology_tables(
        input: SegmentationInput,
        config: SolverConfig,
        objects: &[u8],
        background: &[u8],
    ) -> Result<Self, SolverError> {
        let config = SolverConfig {
            topology_preservation: true,
            ..config
        };
        Self::build(input, config, |config: &SolverConfig| {
            let rule = config.connectivity;
            Ok(Some(TopologyGuard::with_tables(
                Arc::new(TopologyLut::from_packed_bytes(rule, objects)?),
                Arc::new(TopologyLut::from_packed_bytes(rule.dual(), background)?),
            )))
        })
    }

    /// Validation runs before any table is loaded; tables are built on the
    /// solver's own pool.
    fn build<G>(
        input: SegmentationInput,
        config: SolverConfig,
        guard: G,
    ) -> Result<Self, SolverError>
    where
        G: FnOnce(&SolverConfig) -> Result<Option<TopologyGuard>, SolverError> + Send,
    {
        config.validate()?;
        input.validate(&config)?;

        let pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .build()?,
        );
        let install = Arc::clone(&pool);
        install.install(|| {
            let guard = guard(&config)?;
            Self::initialize(input, config, guard, pool)
        })
    }

    fn initialize(
        input: SegmentationInput,
        config: SolverConfig,
        guard: Option<TopologyGuard>,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, SolverError> {
        let dims = input.dims;
        let layers = config.narrow_band_layers;
        let limit = config.distance_limit();
        let mode = config.label_mode;

        // Caller distances are only clamped and signed to match the labels.
        let mut distance = input.distance;
        distance
            .par_iter_mut()
            .zip(input.labels.par_iter())
            .for_each(|(d, &label)| *d = LevelSetField::signed(label, d.abs().min(limit)));
        let field = LevelSetField {
            dims,
            distance,
            labels: input.labels,
        };

        let budget = config.max_active_voxels.unwrap_or(dims.len());
        let mut band = NarrowBand::new(dims.len(), layers, config.chunk_stride, budget);
        band.rebuild(&field)?;

        let map = ForceIndexMap::from_labels(&field.labels, mode);
        let weights = config.weights;
        let mut forces = ForceEvaluator::new(mode, map.clone(), layers);
        if weights.pressure != 0.0 {
            forces = match (&input.pressure, config.intensity_estimation) {
                (Some(image), true) => forces.with_term(Box::new(IntensityFitTerm::new(
                    weights.pressure,
                    image.clone(),
                ))),
                (Some(image), false) => forces.with_term(Box::new(PressureTerm::from_image(
                    weights.pressure,
                    image,
                    weights.target_pressure,
                ))),
                (None, _) => forces.with_term(Box::new(PressureTerm::balloon(weights.pressure))),
            };
        }
        if weights.curvature != 0.0 {
            forces = forces.with_term(Box::new(CurvatureTerm::new(weights.curvature)));
        }
        if weights.vector_field != 0.0 {
            match input.vector_field {
                Some(vectors) => {
                    let components = if dims.is_3d() { 3 } else { 2 };
                    forces = forces.with_term(Box::new(VectorFieldTerm::new(
                        weights.vector_field,
                        components,
                        vectors,
                    )));
                }
                None => log::warn!("Vector field weight set without a vector field; ignoring"),
            }
        }

        let tracker = config.adaptive_convergence.then(|| {
            ConvergenceTracker::new(&field, config.sampling_interval, config.dilation_cycles)
        });
        let estimator = match (config.intensity_estimation, input.pressure) {
            (true, Some(image)) => Some((RegionStatsEstimator::new(mode), image)),
            _ => None,
        };

        log::info!(
            "Solver ready: {}x{}x{} grid, {} active voxels, forces {:?}, topology {:?}",
            dims.width,
            dims.height,
            dims.depth,
            band.len(),
            forces.term_names(),
            guard.as_ref().map(|g| g.rule())
        );

        Ok(Self {
            reducer: TimeStepReducer::new(
                config.voxel_spacing,
                config.convergence_threshold,
                config.chunk_stride,
            ),
            applier: TopologySafeApplier::new(mode, map, guard),
            scratch: field.clone(),
            field,
            band,
            forces,
            deltas: DeltaBuffer::default(),
            extender: DistanceExtender::new(dims.len(), layers),
            tracker,
            estimator,
            stats: None,
            iteration: 0,
            terminal: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: None,
            flips: 0,
            rejected: 0,
            started: None,
            last_report: None,
            pool,
            config,
        })
    }

    /// Set the progress callback, invoked every `resampling_interval` iterations.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Get cancellation handle. Checked once per iteration.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Advance one iteration. Returns false once the run is terminal.
    pub fn step(&mut self) -> Result<bool, SolverError> {
        if self.terminal.is_some() {
            return Ok(false);
        }
        if self.cancelled.load(Ordering::Relaxed) {
            return Ok(self.stop(StopReason::Cancelled));
        }
        if self.band.is_empty() {
            return Ok(self.stop(StopReason::EmptyBand));
        }
        self.started.get_or_insert_with(Instant::now);
        let pool = Arc::clone(&self.pool);
        pool.install(|| self.advance())
    }

    fn advance(&mut self) -> Result<bool, SolverError> {
        if let Some((estimator, image)) = &self.estimator
            && self.iteration % self.config.estimation_interval == 0
        {
            self.stats = Some(estimator.estimate(&self.field, image));
        }

        self.forces.evaluate(
            &self.field,
            self.band.indices(),
            self.stats.as_ref(),
            &mut self.deltas,
        );

        let scale = if self.config.clamp_speed {
            StepScale::Clamped {
                spacing: self.config.voxel_spacing,
            }
        } else {
            match self.reducer.reduce(&self.deltas.speeds) {
                Some(scale) => scale,
                None => return Ok(self.stop(StopReason::Converged)),
            }
        };

        let report = self.applier.apply(
            &self.field,
            &mut self.scratch,
            self.band.indices(),
            &self.deltas,
            scale,
        );
        if report.changed {
            let written = self.extender.extend(&mut self.scratch, self.band.indices());
            self.field.copy_indices_from(&self.scratch, self.band.indices());
            self.field.copy_indices_from(&self.scratch, &written);
        }
        self.iteration += 1;
        self.flips += report.flips as u64;
        self.rejected += report.rejected as u64;

        if let Some(tracker) = &mut self.tracker {
            tracker.observe(self.iteration, &self.field, self.band.indices());
        }
        let tracker = self.tracker.as_ref();
        self.band
            .delete(&self.field, |i| tracker.is_some_and(|t| !t.allows_deletion(i)));
        self.band.add(&self.field)?;

        log::debug!(
            "Iteration {}: {} active, {} flips, {} rejected",
            self.iteration,
            self.band.len(),
            report.flips,
            report.rejected
        );

        if self.iteration % self.config.resampling_interval == 0 {
            self.report_progress();
        }
        if self.band.is_empty() {
            return Ok(self.stop(StopReason::EmptyBand));
        }
        Ok(true)
    }

    fn stop(&mut self, reason: StopReason) -> bool {
        log::info!("Stopping at iteration {}: {:?}", self.iteration, reason);
        self.terminal = Some(reason);
        false
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        let (since, at) = self
            .last_report
            .unwrap_or((self.started.unwrap_or(now), 0));
        let secs = now.duration_since(since).as_secs_f64();
        let rate = if secs > 0.0 {
            (self.iteration - at) as f64 / secs
        } else {
            0.0
        };
        self.last_report = Some((now, self.iteration));

        if let Some(callback) = &self.progress {
            callback(&SolverProgress {
                iteration: self.iteration,
                max_iterations: self.config.max_iterations,
                active_voxels: self.band.len(),
                rate,
                elapsed_secs: self
                    .started
                    .map_or(0.0, |s| now.duration_since(s).as_secs_f64()),
            });
        }
    }

    /// Step until the iteration budget is used or the run turns terminal.
    pub fn solve(&mut self) -> Result<SolveReport, SolverError> {
        let start = Instant::now();
        let first = self.iteration;
        while self.iteration < self.config.max_iterations {
            if !self.step()? {
                break;
            }
        }
        let stop_reason = self.terminal.unwrap_or(StopReason::MaxIterations);
        let elapsed = start.elapsed().as_secs_f64();
        let ran = self.iteration - first;

        let report = SolveReport {
            iterations: self.iteration,
            stop_reason,
            elapsed_secs: elapsed,
            iterations_per_second: if elapsed > 0.0 {
                ran as f64 / elapsed
            } else {
                0.0
            },
            active_voxels: self.band.len(),
            flips: self.flips,
            rejected_flips: self.rejected,
            band_rebuilds: self.band.rebuilds(),
        };
        log::info!(
            "Solve finished after {} iterations ({:?}), {:.1} it/s",
            report.iterations,
            report.stop_reason,
            report.iterations_per_second
        );
        Ok(report)
    }

    pub fn field(&self) -> &LevelSetField {
        &self.field
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn active_voxels(&self) -> usize {
        self.band.len()
    }

    pub fn band(&self) -> &NarrowBand {
        &self.band
    }

    /// Terminal state, if reached.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.terminal
    }

    /// Region statistics from the latest estimation pass.
    pub fn region_stats(&self) -> Option<&RegionStats> {
        self.stats.as_ref()
    }

    /// Release every buffer but the final field.
    pub fn finish(self) -> LevelSetField {
        self.field
    }
}
