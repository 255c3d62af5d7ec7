//! Per-pixel arithmetic kernels.

use crate::substrate::{slot_index, KernelSource, Texel, LANES};

#[inline]
fn map2(a: Texel, b: Texel, f: impl Fn(f32, f32) -> f32) -> Texel {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
}

pub fn copy() -> KernelSource {
    KernelSource::new("copy", 1, &[], |frag| frag.here(0))
}

/// Constant fill. Uniform `value` is a 4-vector.
pub fn fill() -> KernelSource {
    KernelSource::new("fill", 0, &["value"], |frag| {
        let v = frag.vector(0);
        [v[0], v[1], v[2], v[3]]
    })
}

/// `a * scale + offset`.
pub fn scale_offset() -> KernelSource {
    KernelSource::new("scale-offset", 1, &["scale", "offset"], |frag| {
        let (k, o) = (frag.scalar(0), frag.scalar(1));
        frag.here(0).map(|v| v * k + o)
    })
}

pub fn add() -> KernelSource {
    KernelSource::new("add", 2, &[], |frag| map2(frag.here(0), frag.here(1), |a, b| a + b))
}

pub fn multiply() -> KernelSource {
    KernelSource::new("multiply", 2, &[], |frag| {
        map2(frag.here(0), frag.here(1), |a, b| a * b)
    })
}

/// Momentum step on the velocity: `μ·v − lr·(g·invBatch + λ·w)`.
///
/// Inputs: velocity, accumulated gradient, current weights.
pub fn momentum_velocity() -> KernelSource {
    KernelSource::new(
        "momentum-velocity",
        3,
        &["learning_rate", "l2_decay", "momentum", "inv_batch"],
        |frag| {
            let (lr, l2, mu, inv) = (
                frag.scalar(0),
                frag.scalar(1),
                frag.scalar(2),
                frag.scalar(3),
            );
            let v = frag.here(0);
            let g = frag.here(1);
            let w = frag.here(2);
            let mut out = [0.0; LANES];
            for lane in 0..LANES {
                out[lane] = mu * v[lane] - lr * (g[lane] * inv + l2 * w[lane]);
            }
            out
        },
    )
}

/// Per-lane `(o − e)² · mask`. Inputs: output, expected, delta mask.
pub fn masked_squared_error() -> KernelSource {
    KernelSource::new("masked-squared-error", 3, &[], |frag| {
        let (o, e, m) = (frag.here(0), frag.here(1), frag.here(2));
        let mut out = [0.0; LANES];
        for lane in 0..LANES {
            let d = o[lane] - e[lane];
            out[lane] = d * d * m[lane];
        }
        out
    })
}

/// Zeroes every packed slot at or beyond `active`.
pub fn neuron_mask() -> KernelSource {
    KernelSource::new("neuron-mask", 1, &["active"], |frag| {
        let active = frag.scalar(0) as usize;
        let texel = frag.here(0);
        let mut out = [0.0; LANES];
        for lane in 0..LANES {
            if slot_index(frag.x, frag.y, lane, frag.side()) < active {
                out[lane] = texel[lane];
            }
        }
        out
    })
}
