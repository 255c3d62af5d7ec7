use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use texel_core::{Buffer, ComputeContext, Connectivity, ConnectivitySpec, Precision};

fn random_buffer(ctx: &ComputeContext, side: usize, rng: &mut StdRng) -> Buffer {
    let mut buffer = ctx.buffer(side).unwrap();
    let values: Vec<f32> = (0..buffer.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    buffer.upload(&values).unwrap();
    buffer
}

fn inner(a: &[f32], b: &[f32]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

fn assert_close(a: f64, b: f64, what: &str) {
    let tolerance = 1e-4 * (1.0 + a.abs().max(b.abs()));
    assert!((a - b).abs() <= tolerance, "{what}: {a} vs {b}");
}

/// With zero bias, `<forward(a), δ> = <a, backward(δ)> = <w, gradient(δ, a)>`.
fn check_transpose(spec: ConnectivitySpec, from: usize, to: usize) {
    let ctx = ComputeContext::new("transpose").unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let mut connectivity = Connectivity::new(&ctx, spec, from, to, Precision::Full, &mut rng).unwrap();
    if spec == ConnectivitySpec::Direct {
        // constant initialisation would hide lane mix-ups
        let count = connectivity.geometry().weight_count();
        let weights: Vec<f32> = (0..count).map(|_| rng.gen_range(-1.0..1.0)).collect();
        connectivity.load_weights(&ctx, &weights).unwrap();
    }

    let input = random_buffer(&ctx, from, &mut rng);
    let delta = random_buffer(&ctx, to, &mut rng);
    let bias = ctx.buffer(to).unwrap();

    let mut forward = ctx.buffer(to).unwrap();
    connectivity
        .feedforward(&ctx, &input, &bias, &mut forward)
        .unwrap();
    let mut upstream = ctx.buffer(from).unwrap();
    connectivity
        .backpropagate(&ctx, &delta, &mut upstream)
        .unwrap();
    connectivity
        .accumulate_gradient(&ctx, &delta, &input)
        .unwrap();

    let lhs = inner(&forward.to_vec(), &delta.to_vec());
    let rhs = inner(&input.to_vec(), &upstream.to_vec());
    let grad = inner(
        &connectivity.weights().to_vec(),
        &connectivity.gradient().to_vec(),
    );
    assert!(lhs.abs() > 1e-6, "{} produced a degenerate forward pass", spec.name());
    assert_close(lhs, rhs, &format!("{} backward", spec.name()));
    assert_close(lhs, grad, &format!("{} gradient", spec.name()));
}

#[test]
fn test_full_transpose() {
    check_transpose(ConnectivitySpec::Full, 4, 2);
    check_transpose(ConnectivitySpec::Full, 2, 4);
}

#[test]
fn test_full_npot_transpose() {
    check_transpose(ConnectivitySpec::FullNPoT, 3, 5);
    check_transpose(ConnectivitySpec::FullNPoT, 4, 2);
}

#[test]
fn test_square_transpose() {
    check_transpose(ConnectivitySpec::Square { sparsity: 3 }, 4, 2);
    check_transpose(ConnectivitySpec::Square { sparsity: 2 }, 5, 3);
    check_transpose(ConnectivitySpec::Square { sparsity: 3 }, 2, 4);
}

#[test]
fn test_square_fast_transpose() {
    check_transpose(ConnectivitySpec::SquareFast { sparsity: 3 }, 4, 4);
    check_transpose(ConnectivitySpec::SquareFast { sparsity: 1 }, 4, 2);
}

#[test]
fn test_conv_transpose() {
    check_transpose(ConnectivitySpec::Conv { kernels: 2, sparsity: 3 }, 4, 2);
    check_transpose(ConnectivitySpec::Conv { kernels: 1, sparsity: 3 }, 4, 4);
    check_transpose(ConnectivitySpec::Conv { kernels: 2, sparsity: 2 }, 4, 4);
}

#[test]
fn test_direct_transpose() {
    check_transpose(ConnectivitySpec::Direct, 4, 4);
}

#[test]
fn test_square_fast_matches_square_for_integral_strides() {
    let ctx = ComputeContext::new("square-parity").unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let fast = Connectivity::new(
        &ctx,
        ConnectivitySpec::SquareFast { sparsity: 3 },
        4,
        4,
        Precision::Full,
        &mut rng,
    )
    .unwrap();
    let mut tabled = Connectivity::new(
        &ctx,
        ConnectivitySpec::Square { sparsity: 3 },
        4,
        4,
        Precision::Full,
        &mut rng,
    )
    .unwrap();
    tabled
        .load_weights(&ctx, &fast.weights().to_vec())
        .unwrap();

    let input = random_buffer(&ctx, 4, &mut rng);
    let bias = random_buffer(&ctx, 4, &mut rng);
    let mut a = ctx.buffer(4).unwrap();
    let mut b = ctx.buffer(4).unwrap();
    fast.feedforward(&ctx, &input, &bias, &mut a).unwrap();
    tabled.feedforward(&ctx, &input, &bias, &mut b).unwrap();
    for (x, y) in a.to_vec().iter().zip(b.to_vec()) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn test_rejected_geometries() {
    assert!(ConnectivitySpec::SquareFast { sparsity: 3 }.validate(4, 2).is_err());
    assert!(ConnectivitySpec::SquareFast { sparsity: 2 }.validate(4, 4).is_err());
    assert!(ConnectivitySpec::Conv { kernels: 1, sparsity: 3 }.validate(4, 3).is_err());
    assert!(ConnectivitySpec::Full.validate(3, 2).is_err());
    assert!(ConnectivitySpec::Direct.validate(4, 2).is_err());

    // stride 3*4/4 is integral, but 4 does not split into 3 kernel tiles
    let tiling = ConnectivitySpec::Conv { kernels: 3, sparsity: 1 }
        .validate(4, 4)
        .unwrap_err();
    assert!(tiling.to_string().contains("cannot be tiled"), "{tiling}");
    let stride = ConnectivitySpec::Conv { kernels: 1, sparsity: 3 }
        .validate(4, 3)
        .unwrap_err();
    assert!(stride.to_string().contains("not integral"), "{stride}");

    let ctx = ComputeContext::new("rejected").unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let err = Connectivity::new(
        &ctx,
        ConnectivitySpec::SquareFast { sparsity: 3 },
        4,
        2,
        Precision::Full,
        &mut rng,
    )
    .unwrap_err();
    assert_eq!(err.category(), "configuration");
}

#[test]
fn test_mismatched_buffer_sides_are_reported() {
    let ctx = ComputeContext::new("sides").unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let connectivity =
        Connectivity::new(&ctx, ConnectivitySpec::Full, 4, 2, Precision::Full, &mut rng).unwrap();
    let input = ctx.buffer(2).unwrap();
    let bias = ctx.buffer(2).unwrap();
    let mut target = ctx.buffer(2).unwrap();
    assert!(connectivity
        .feedforward(&ctx, &input, &bias, &mut target)
        .is_err());
}
