//! Convolutional wiring.
//!
//! The destination grid is split into `K × K` tiles of side `m = to / K`.
//! Tile `κ` applies one shared kernel (four output lanes, `s × s` taps) at
//! `m × m` positions spaced `stride = from / m` apart, so every tile sees the
//! whole source. Weight pixel `(κ·4 + lane)·s² + t`.

use super::addressing::{pixel_xy, texel_at};
use super::square::{accumulate, ceil_div, floor_div, stride_centre, window_sum};
use super::{Geometry, WeightInit, Wiring};
use crate::substrate::{KernelSource, LANES};

pub(super) fn geometry(from: usize, to: usize, kernels: usize, sparsity: usize) -> Geometry {
    Geometry::new(from, to, 2 * kernels * sparsity, LANES * sparsity * sparsity)
}

pub(super) fn wiring(geometry: Geometry, kernels: usize, sparsity: usize) -> Wiring {
    let Geometry { from, to, .. } = geometry;
    let taps = sparsity * sparsity;
    let tile = to / kernels;
    let stride = from / tile;
    let centre = stride_centre(stride, sparsity);
    let origin = move |u: usize| u as i64 * stride as i64 + centre;

    let forward = KernelSource::new("conv-forward", 3, &[], move |frag| {
        let kernel = (frag.y / tile) * kernels + frag.x / tile;
        let (ox, oy) = (origin(frag.x % tile), origin(frag.y % tile));
        let mut out = frag.here(1);
        for (lane, value) in out.iter_mut().enumerate() {
            let row = (kernel * LANES + lane) * taps;
            *value += window_sum(frag.input(2), frag.input(0), row, ox, oy, sparsity);
        }
        out
    });

    let backward = KernelSource::new("conv-backward", 2, &[], move |frag| {
        let delta = frag.input(0);
        let weights = frag.input(1);
        let (stride_i, s_i, last) = (stride as i64, sparsity as i64, tile as i64 - 1);
        let range = |v: usize| {
            let v = v as i64;
            let lo = ceil_div(v - centre - s_i + 1, stride_i).max(0);
            let hi = floor_div(v - centre, stride_i).min(last);
            lo..=hi
        };
        let mut up = [0.0; LANES];
        for v in range(frag.y) {
            let wy = frag.y as i64 - origin(v as usize);
            for u in range(frag.x) {
                let wx = frag.x as i64 - origin(u as usize);
                let tap = (wy * s_i + wx) as usize;
                for ky in 0..kernels {
                    for kx in 0..kernels {
                        let kernel = ky * kernels + kx;
                        let dest = (ky * tile + v as usize) * to + kx * tile + u as usize;
                        for ld in 0..LANES {
                            let d = delta.get(dest * LANES + ld);
                            if d == 0.0 {
                                continue;
                            }
                            let w = texel_at(weights, (kernel * LANES + ld) * taps + tap);
                            for lane in 0..LANES {
                                up[lane] += d * w[lane];
                            }
                        }
                    }
                }
            }
        }
        up
    });

    let gradient = KernelSource::new("conv-gradient", 3, &[], move |frag| {
        let p = frag.pixel();
        let (row, t) = (p / taps, p % taps);
        let (kernel, ld) = (row / LANES, row % LANES);
        let (kx, ky) = pixel_xy(kernel, kernels);
        let (wx, wy) = ((t % sparsity) as i64, (t / sparsity) as i64);
        let delta = frag.input(0);
        let input = frag.input(1);
        let mut g = frag.here(2);
        for v in 0..tile {
            for u in 0..tile {
                let dest = (ky * tile + v) * to + kx * tile + u;
                let d = delta.get(dest * LANES + ld);
                if d == 0.0 {
                    continue;
                }
                let a = input.texel_or_zero(origin(u) + wx, origin(v) + wy);
                g = accumulate(g, d, a);
            }
        }
        g
    });

    Wiring::untabled(forward, backward, gradient, WeightInit::Xavier)
}
