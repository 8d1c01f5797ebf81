//! Benchmarks for the narrow-band solver.

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use active_contours::{
    compute::{
        ConnectivityRule, DistanceExtender, GridDims, LabelMode, LevelSetField, NarrowBand,
        SegmentationInput, Solver, TopologyLut,
    },
    schema::{ForceWeights, Seed, SolverConfig},
};

fn scene(dims: GridDims, mode: LabelMode) -> SegmentationInput {
    let seed = Seed::default();
    let labels = seed.generate_labels(dims, mode);
    let mut input = SegmentationInput::from_labels(dims, labels).unwrap();
    if let Some(image) = seed.generate_image(dims) {
        input = input.with_pressure(image);
    }
    input
}

fn bench_solver_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("solver_10_steps");

    for size in [64, 128, 256, 512] {
        let dims = GridDims::new_2d(size, size);
        let config = SolverConfig {
            weights: ForceWeights::default(),
            ..Default::default()
        };

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", size, size)),
            &size,
            |b, _| {
                b.iter_batched(
                    || Solver::new(scene(dims, LabelMode::Exclusive), config.clone()).unwrap(),
                    |mut solver| {
                        for _ in 0..10 {
                            solver.step().unwrap();
                        }
                        black_box(solver.active_voxels())
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_topology(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology");
    let dims = GridDims::new_2d(128, 128);

    for preserve in [false, true] {
        let config = SolverConfig {
            topology_preservation: preserve,
            connectivity: ConnectivityRule::EightFour,
            ..Default::default()
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(if preserve { "guarded" } else { "free" }),
            &preserve,
            |b, _| {
                b.iter_batched(
                    || Solver::new(scene(dims, LabelMode::Exclusive), config.clone()).unwrap(),
                    |mut solver| {
                        for _ in 0..10 {
                            solver.step().unwrap();
                        }
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.bench_function("generate_lut_2d", |b| {
        b.iter(|| TopologyLut::generate(black_box(ConnectivityRule::FourEight)));
    });

    group.finish();
}

fn bench_band_maintenance(c: &mut Criterion) {
    let mut group = c.benchmark_group("band");

    for size in [32, 64] {
        let dims = GridDims::new_3d(size, size, size);
        let labels = Seed::default().generate_labels(dims, LabelMode::Exclusive);
        let field = LevelSetField::from_labels(dims, labels, 3).unwrap();

        group.bench_with_input(
            BenchmarkId::new("rebuild", format!("{}^3", size)),
            &size,
            |b, _| {
                let mut band = NarrowBand::new(dims.len(), 3, 128, dims.len());
                b.iter(|| band.rebuild(black_box(&field)).unwrap());
            },
        );

        group.bench_with_input(
            BenchmarkId::new("extend_full", format!("{}^3", size)),
            &size,
            |b, _| {
                let mut extender = DistanceExtender::new(dims.len(), 3);
                b.iter_batched(
                    || field.clone(),
                    |mut f| extender.extend_full(&mut f),
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_solver_steps,
    bench_topology,
    bench_band_maintenance
);
criterion_main!(benches);
