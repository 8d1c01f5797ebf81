//! Compute module - Narrow-band level-set evolution.

mod applier;
mod convergence;
mod extender;
mod forces;
mod grid;
mod narrow_band;
mod region_stats;
mod solver;
mod time_step;

pub mod scan;
pub mod topology;

pub use applier::*;
pub use convergence::*;
pub use extender::*;
pub use forces::*;
pub use grid::*;
pub use narrow_band::*;
pub use region_stats::*;
pub use solver::*;
pub use time_step::*;
pub use topology::{ConnectivityRule, LutError, TopologyLut, count_components};
