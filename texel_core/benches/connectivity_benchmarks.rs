//! Forward/backward throughput of the connectivity variants
//!
//! Run with: cargo bench --bench connectivity_benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use texel_core::{
    Buffer, ComputeContext, Connectivity, ConnectivitySpec, Cost, LayerSpec, Network, Precision,
    ProviderRegistry, Trainer,
};

#[derive(Deserialize)]
struct NetworkLayers {
    layers: Vec<LayerSpec>,
}

fn random_buffer(ctx: &ComputeContext, side: usize, rng: &mut StdRng) -> Buffer {
    let mut buffer = ctx.buffer(side).unwrap();
    let values: Vec<f32> = (0..buffer.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    buffer.upload(&values).unwrap();
    buffer
}

/// Variants wired between a 16x16 source and an 8x8 destination where the
/// geometry allows it.
fn variants() -> Vec<(ConnectivitySpec, usize, usize)> {
    vec![
        (ConnectivitySpec::Full, 16, 8),
        (ConnectivitySpec::FullNPoT, 15, 7),
        (ConnectivitySpec::Square { sparsity: 5 }, 16, 8),
        (ConnectivitySpec::SquareFast { sparsity: 3 }, 16, 8),
        (ConnectivitySpec::Conv { kernels: 2, sparsity: 5 }, 16, 8),
        (ConnectivitySpec::Direct, 16, 16),
    ]
}

fn bench_feedforward(c: &mut Criterion) {
    let ctx = ComputeContext::new("bench").unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let mut group = c.benchmark_group("feedforward");

    for (spec, from, to) in variants() {
        let connectivity =
            Connectivity::new(&ctx, spec, from, to, Precision::Full, &mut rng).unwrap();
        let input = random_buffer(&ctx, from, &mut rng);
        let bias = random_buffer(&ctx, to, &mut rng);
        let mut target = ctx.buffer(to).unwrap();

        group.bench_with_input(BenchmarkId::new(spec.name(), from), &from, |b, _| {
            b.iter(|| {
                connectivity
                    .feedforward(&ctx, black_box(&input), &bias, &mut target)
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_backpropagate(c: &mut Criterion) {
    let ctx = ComputeContext::new("bench").unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let mut group = c.benchmark_group("backpropagate");

    for (spec, from, to) in variants() {
        let mut connectivity =
            Connectivity::new(&ctx, spec, from, to, Precision::Full, &mut rng).unwrap();
        let input = random_buffer(&ctx, from, &mut rng);
        let delta = random_buffer(&ctx, to, &mut rng);
        let mut upstream = ctx.buffer(from).unwrap();

        group.bench_with_input(BenchmarkId::new(spec.name(), from), &from, |b, _| {
            b.iter(|| {
                connectivity
                    .backpropagate(&ctx, black_box(&delta), &mut upstream)
                    .unwrap();
                connectivity
                    .accumulate_gradient(&ctx, &delta, &input)
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_xor_minibatches(c: &mut Criterion) {
    let script = r#"
        [network]
        layers = [
            { type = "input", size = 1, neurons = 4 },
            { type = "neuron", size = 1, neurons = 2, connectivity = { kind = "full" } },
        ]

        [problem]
        provider = "xorLike"
        test_samples = 4

        [training]
        learning_rates = [0.3]
        minibatch_size = 4
        minibatches = 1000000
        test_every = 1000000
    "#;
    let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
    trainer.load_str(script).unwrap();

    c.bench_function("xor_minibatch", |b| {
        b.iter(|| {
            black_box(trainer.step().unwrap());
        });
    });
}

fn bench_network_forward(c: &mut Criterion) {
    let ctx = ComputeContext::new("bench").unwrap();
    let specs: NetworkLayers = toml::from_str(
        r#"
        layers = [
            { type = "input", size = 16, preprocessing = "grayscaleLocalNorm" },
            { type = "neuron", size = 8, activation = "relu", connectivity = { kind = "squareFast", sparsity = 3 } },
            { type = "neuron", size = 2, neurons = 5, activation = "sigmoid", connectivity = { kind = "full" } },
        ]
        "#,
    )
    .unwrap();
    let mut network = Network::new(ctx.clone(), &specs.layers, Cost::Quadratic, 0).unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let input = random_buffer(&ctx, 16, &mut rng);

    c.bench_function("network_forward_16", |b| {
        b.iter(|| {
            network.forward(black_box(&input), 0.5).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_feedforward,
    bench_backpropagate,
    bench_xor_minibatches,
    bench_network_forward
);
criterion_main!(benches);
