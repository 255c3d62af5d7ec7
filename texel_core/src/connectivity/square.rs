//! Windowed wiring: destination neuron `i` reads an `s × s` window of source
//! pixels, weight pixel `i·s² + t` holding tap `t = wy·s + wx`.
//!
//! `Square` supports any side ratio through a precomputed origin table and a
//! compressed transpose index. `SquareFast` restricts the geometry to odd
//! windows and an integral stride so that both directions are computed
//! arithmetically.

use std::sync::Arc;

use super::addressing::{
    dot, index, origin_table, pixel_xy, signed, texel_at, OriginFn, TransposeIndex,
};
use super::{Geometry, WeightInit, Wiring};
use crate::error::DeviceError;
use crate::substrate::{Buffer, Device, KernelSource, Texel, LANES};

pub(super) fn geometry(from: usize, to: usize, sparsity: usize) -> Geometry {
    Geometry::new(from, to, 2 * to * sparsity, LANES * sparsity * sparsity)
}

/// Window origin for arbitrary ratios: the window is centred on the
/// destination pixel centre mapped into source space.
pub(crate) fn scaled_origin(from: usize, to: usize, sparsity: usize) -> impl Fn(usize, usize) -> (i64, i64) {
    let scale = from as f64 / to as f64;
    let half = (sparsity as f64 - 1.0) / 2.0;
    move |x, y| {
        let cx = (x as f64 + 0.5) * scale - 0.5;
        let cy = (y as f64 + 0.5) * scale - 0.5;
        ((cx - half).round() as i64, (cy - half).round() as i64)
    }
}

/// Offset of the first tap relative to `X·stride` for integral strides.
pub(crate) fn stride_centre(stride: usize, sparsity: usize) -> i64 {
    (stride as i64 - sparsity as i64).div_euclid(2)
}

/// Floor and ceiling of `a / b` for positive `b`.
pub(crate) fn floor_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    -(-a).div_euclid(b)
}

/// `Σ_t w(row + t) · a(origin + t)` with zero padding.
#[inline]
pub(crate) fn window_sum(weights: &Buffer, input: &Buffer, row: usize, ox: i64, oy: i64, sparsity: usize) -> f32 {
    let mut sum = 0.0;
    for wy in 0..sparsity {
        for wx in 0..sparsity {
            let a = input.texel_or_zero(ox + wx as i64, oy + wy as i64);
            sum += dot(texel_at(weights, row + wy * sparsity + wx), a);
        }
    }
    sum
}

#[inline]
pub(crate) fn accumulate(prev: Texel, d: f32, a: Texel) -> Texel {
    [
        prev[0] + d * a[0],
        prev[1] + d * a[1],
        prev[2] + d * a[2],
        prev[3] + d * a[3],
    ]
}

pub(super) fn wiring(
    device: &Device,
    geometry: Geometry,
    sparsity: usize,
    fast: bool,
) -> Result<Wiring, DeviceError> {
    if fast {
        Ok(fast_wiring(geometry, sparsity))
    } else {
        tabled_wiring(device, geometry, sparsity)
    }
}

fn tabled_wiring(device: &Device, geometry: Geometry, sparsity: usize) -> Result<Wiring, DeviceError> {
    let Geometry { from, to, .. } = geometry;
    let taps = sparsity * sparsity;
    let origin: Arc<OriginFn> = Arc::new(scaled_origin(from, to, sparsity));
    let origins = origin_table(device, to, origin.as_ref())?;
    let transpose = TransposeIndex::build(from, to, sparsity, origin.as_ref());
    let (offsets, entries) = transpose.upload(device, from, to)?;

    let forward = KernelSource::new("square-forward", 4, &[], move |frag| {
        let o = frag.here(3);
        let (ox, oy) = (signed(o[0]), signed(o[1]));
        let mut out = frag.here(1);
        let base = frag.pixel() * LANES;
        for (lane, value) in out.iter_mut().enumerate() {
            *value += window_sum(frag.input(2), frag.input(0), (base + lane) * taps, ox, oy, sparsity);
        }
        out
    });

    let backward = KernelSource::new("square-backward", 4, &[], move |frag| {
        let delta = frag.input(0);
        let weights = frag.input(1);
        let range = frag.here(2);
        let start = index(range[0]);
        let count = index(range[1]);
        let mut up = [0.0; LANES];
        for k in start..start + count {
            let entry = texel_at(frag.input(3), k);
            let dest = index(entry[1]) * to + index(entry[0]);
            let tap = index(entry[2]);
            for ld in 0..LANES {
                let i = dest * LANES + ld;
                let d = delta.get(i);
                let w = texel_at(weights, i * taps + tap);
                for lane in 0..LANES {
                    up[lane] += d * w[lane];
                }
            }
        }
        up
    });

    let gradient = KernelSource::new("square-gradient", 4, &[], move |frag| {
        let p = frag.pixel();
        let (i, t) = (p / taps, p % taps);
        let (dx, dy) = pixel_xy(i / LANES, to);
        let o = frag.fetch(3, dx, dy);
        let sx = signed(o[0]) + (t % sparsity) as i64;
        let sy = signed(o[1]) + (t / sparsity) as i64;
        let a = frag.input(1).texel_or_zero(sx, sy);
        accumulate(frag.here(2), frag.input(0).get(i), a)
    });

    Ok(Wiring {
        forward,
        backward,
        gradient,
        tables: vec![origins, offsets, entries],
        forward_tables: vec![0],
        backward_tables: vec![1, 2],
        gradient_tables: vec![0],
        init: WeightInit::Xavier,
    })
}

fn fast_wiring(geometry: Geometry, sparsity: usize) -> Wiring {
    let Geometry { from, to, .. } = geometry;
    let taps = sparsity * sparsity;
    let stride = from / to;
    let centre = stride_centre(stride, sparsity);
    let origin = move |x: usize| x as i64 * stride as i64 + centre;

    let forward = KernelSource::new("square-fast-forward", 3, &[], move |frag| {
        let (ox, oy) = (origin(frag.x), origin(frag.y));
        let mut out = frag.here(1);
        let base = frag.pixel() * LANES;
        for (lane, value) in out.iter_mut().enumerate() {
            *value += window_sum(frag.input(2), frag.input(0), (base + lane) * taps, ox, oy, sparsity);
        }
        out
    });

    let backward = KernelSource::new("square-fast-backward", 2, &[], move |frag| {
        let delta = frag.input(0);
        let weights = frag.input(1);
        let (stride_i, s_i, last) = (stride as i64, sparsity as i64, to as i64 - 1);
        let range = |v: usize| {
            let v = v as i64;
            let lo = ceil_div(v - centre - s_i + 1, stride_i).max(0);
            let hi = floor_div(v - centre, stride_i).min(last);
            lo..=hi
        };
        let mut up = [0.0; LANES];
        for dy in range(frag.y) {
            let wy = frag.y as i64 - origin(dy as usize);
            for dx in range(frag.x) {
                let wx = frag.x as i64 - origin(dx as usize);
                let tap = (wy * s_i + wx) as usize;
                let dest = dy as usize * to + dx as usize;
                for ld in 0..LANES {
                    let i = dest * LANES + ld;
                    let d = delta.get(i);
                    let w = texel_at(weights, i * taps + tap);
                    for lane in 0..LANES {
                        up[lane] += d * w[lane];
                    }
                }
            }
        }
        up
    });

    let gradient = KernelSource::new("square-fast-gradient", 3, &[], move |frag| {
        let p = frag.pixel();
        let (i, t) = (p / taps, p % taps);
        let (dx, dy) = pixel_xy(i / LANES, to);
        let sx = origin(dx) + (t % sparsity) as i64;
        let sy = origin(dy) + (t / sparsity) as i64;
        let a = frag.input(1).texel_or_zero(sx, sy);
        accumulate(frag.here(2), frag.input(0).get(i), a)
    });

    Wiring::untabled(forward, backward, gradient, WeightInit::Xavier)
}
