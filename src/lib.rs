//! Active Contours - Parallel narrow-band level-set segmentation.
//!
//! This crate evolves one or more labeled regions on a 2D or 3D voxel grid
//! toward object boundaries under pressure, curvature and vector-field
//! forces. Only a narrow band of voxels around each front is updated, and
//! label changes can be restricted to simple points so that the digital
//! topology of every object is preserved.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration types and seeding for segmentation runs
//! - `compute`: The level-set engine (narrow band, forces, topology, solver)
//!
//! # Example
//!
//! ```rust,no_run
//! use active_contours::{
//!     compute::{GridDims, SegmentationInput, Solver},
//!     schema::{Seed, SolverConfig},
//! };
//!
//! let dims = GridDims::new_2d(128, 128);
//! let config = SolverConfig::default();
//!
//! // Labels and a synthetic pressure image from a seed
//! let seed = Seed::default();
//! let labels = seed.generate_labels(dims, config.label_mode);
//! let mut input = SegmentationInput::from_labels(dims, labels)?;
//! if let Some(image) = seed.generate_image(dims) {
//!     input = input.with_pressure(image);
//! }
//!
//! let mut solver = Solver::new(input, config)?;
//! let report = solver.solve()?;
//! println!("Stopped after {} iterations: {:?}", report.iterations, report.stop_reason);
//! # Ok::<(), active_contours::compute::SolverError>(())
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{LevelSetField, SegmentationInput, SegmentationStats, Solver, SolverError};
pub use schema::{Pattern, Seed, SolverConfig};
