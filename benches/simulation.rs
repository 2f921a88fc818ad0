//! Criterion benchmarks for the growth simulation.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use growgrid::{Simulation, SimulationConfig};

fn make_sim(side: usize, radius: f64) -> Simulation {
    let mut cfg = SimulationConfig::default()
        .with_grid(side, side)
        .with_epochs(0.01, 1000)
        .with_seed(42);
    cfg.growth.start_radius = radius;
    Simulation::new(cfg).expect("benchmark config is valid")
}

/// Fine steps on grids of increasing size, with overlapping fields so every
/// neuron has synapses.
fn bench_step_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_size");

    for side in [8usize, 16, 32, 48] {
        group.throughput(Throughput::Elements((side * side) as u64));
        group.bench_with_input(BenchmarkId::new("step", side), &side, |b, &side| {
            let mut sim = make_sim(side, 1.2);
            b.iter(|| black_box(sim.step().expect("step")));
        });
    }

    group.finish();
}

/// A full epoch: 100 fine steps plus the growth rebuild.
fn bench_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch");
    group.sample_size(20);

    for side in [8usize, 16, 32] {
        group.bench_with_input(BenchmarkId::new("run_epoch", side), &side, |b, &side| {
            b.iter_batched(
                || make_sim(side, 0.8),
                |mut sim| black_box(sim.run_epoch().expect("epoch")),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_memory_image(c: &mut Criterion) {
    let mut sim = make_sim(24, 1.2);
    sim.run_epochs(2).expect("warm-up epochs");
    let bytes = sim.memory_image_bytes().expect("image");

    let mut group = c.benchmark_group("memory_image");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("save", |b| {
        b.iter(|| black_box(sim.memory_image_bytes().expect("save")))
    });
    group.bench_function("load", |b| {
        let mut target = make_sim(24, 1.2);
        b.iter(|| target.load_memory_bytes(black_box(&bytes)).expect("load"))
    });
    group.finish();
}

criterion_group!(benches, bench_step_sizes, bench_epoch, bench_memory_image);
criterion_main!(benches);
