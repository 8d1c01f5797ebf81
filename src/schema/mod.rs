//! Schema module - Configuration and seeding types for segmentation runs.

mod config;
mod seed;

pub use config::*;
pub use seed::*;
