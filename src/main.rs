//! Active Contours CLI - Run a segmentation from JSON configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use active_contours::{
    compute::{GridDims, SegmentationInput, SegmentationStats, Solver, StopReason},
    schema::{Seed, SolverConfig},
};

/// Grid size plus solver settings, as stored in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SceneConfig {
    width: usize,
    height: usize,
    /// 1 for a 2D run.
    depth: usize,
    solver: SolverConfig,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            depth: 1,
            solver: SolverConfig::default(),
        }
    }
}

impl SceneConfig {
    fn dims(&self) -> GridDims {
        if self.depth > 1 {
            GridDims::new_3d(self.width, self.height, self.depth)
        } else {
            GridDims::new_2d(self.width, self.height)
        }
    }
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [iterations]", args[0]);
        eprintln!();
        eprintln!("Run a level-set segmentation from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to scene configuration file");
        eprintln!("  iterations   Iteration budget (default: solver.max_iterations)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let mut scene: SceneConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });
    if let Some(iterations) = args.get(2).and_then(|s| s.parse().ok()) {
        scene.solver.max_iterations = iterations;
    }

    // Load or create seed
    let seed_path = config_path.with_extension("seed.json");
    let seed: Seed = if seed_path.exists() {
        let seed_str = fs::read_to_string(&seed_path).unwrap_or_else(|e| {
            eprintln!("Error reading seed file: {}", e);
            std::process::exit(1);
        });
        serde_json::from_str(&seed_str).unwrap_or_else(|e| {
            eprintln!("Error parsing seed: {}", e);
            std::process::exit(1);
        })
    } else {
        Seed::default()
    };

    let dims = scene.dims();
    let config = scene.solver;
    let iterations = config.max_iterations;
    let mode = config.label_mode;

    println!("Active Contours Segmentation");
    println!("============================");
    println!("Grid: {}x{}x{}", dims.width, dims.height, dims.depth);
    println!("Label mode: {:?}", mode);
    println!(
        "Weights: pressure={}, curvature={}, vector={}",
        config.weights.pressure, config.weights.curvature, config.weights.vector_field
    );
    if config.topology_preservation {
        println!("Topology: {:?}", config.connectivity);
    }
    println!("Iterations: {}", iterations);
    println!();

    // Initialize
    let labels = seed.generate_labels(dims, mode);
    let mut input = SegmentationInput::from_labels(dims, labels).unwrap_or_else(|e| {
        eprintln!("Error building input: {}", e);
        std::process::exit(1);
    });
    if let Some(image) = seed.generate_image(dims) {
        input = input.with_pressure(image);
    }

    let mut solver = Solver::new(input, config).unwrap_or_else(|e| {
        eprintln!("Error initializing solver: {}", e);
        std::process::exit(1);
    });
    let initial_stats = SegmentationStats::from_field(solver.field(), mode);

    println!("Initial state:");
    print_stats(&initial_stats);
    println!("  Active voxels: {}", solver.active_voxels());
    println!();

    // Run segmentation
    println!("Running segmentation...");
    let start = Instant::now();

    for i in 0..iterations {
        let running = solver.step().unwrap_or_else(|e| {
            eprintln!("Error at iteration {}: {}", i, e);
            std::process::exit(1);
        });
        if !running {
            break;
        }

        // Print progress every 10%
        if (i + 1) % (iterations / 10).max(1) == 0 {
            let elapsed = start.elapsed().as_secs_f32();
            println!(
                "  Iteration {}/{}: active={}, {:.1} it/s",
                i + 1,
                iterations,
                solver.active_voxels(),
                (i + 1) as f32 / elapsed
            );
        }
    }

    let elapsed = start.elapsed();
    let final_stats = SegmentationStats::from_field(solver.field(), mode);
    let stop_reason = solver.stop_reason().unwrap_or(StopReason::MaxIterations);

    println!();
    println!("Final state ({:?}):", stop_reason);
    print_stats(&final_stats);
    println!("  Active voxels: {}", solver.active_voxels());
    println!("  Band rebuilds: {}", solver.band().rebuilds());
    println!();
    println!(
        "Time: {:.2}s ({:.1} it/s)",
        elapsed.as_secs_f32(),
        solver.iteration() as f32 / elapsed.as_secs_f32()
    );
}

fn print_stats(stats: &SegmentationStats) {
    println!("  Inside voxels: {}", stats.inside_voxels);
    println!("  Front voxels: {}", stats.front_voxels);
    for (object, area) in &stats.object_areas {
        println!("  Object {}: {} voxels", object, area);
    }
}

fn print_example_config() {
    let scene = SceneConfig::default();
    let seed = Seed::default();

    println!("Example configuration (config.json):");
    println!("{}", serde_json::to_string_pretty(&scene).unwrap());
    println!();
    println!("Example seed (config.seed.json):");
    println!("{}", serde_json::to_string_pretty(&seed).unwrap());
}
