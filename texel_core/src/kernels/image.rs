//! Image-space kernels used by preprocessing, augmentation and sample
//! synthesis. Colour lanes are `(r, g, b, a)`.

use crate::substrate::{Fragment, KernelSource, Texel, LANES};

/// Gaussian taps are cut at three standard deviations, capped here.
pub const MAX_BLUR_TAPS: i64 = 32;

pub fn luminance(texel: Texel) -> f32 {
    0.299 * texel[0] + 0.587 * texel[1] + 0.114 * texel[2]
}

/// Luminance broadcast to every lane.
pub fn grayscale() -> KernelSource {
    KernelSource::new("grayscale", 1, &[], |frag| {
        let l = luminance(frag.here(0));
        [l; LANES]
    })
}

fn gaussian_pass(frag: &Fragment<'_>, dx: i64, dy: i64) -> Texel {
    let sigma = frag.scalar(0);
    let (x, y) = (frag.x as i64, frag.y as i64);
    let source = frag.input(0);
    if sigma <= 1e-3 {
        return source.texel_clamped(x, y);
    }
    let taps = ((3.0 * sigma).ceil() as i64).clamp(1, MAX_BLUR_TAPS);
    let denom = 2.0 * sigma * sigma;
    let mut acc = [0.0; LANES];
    let mut total = 0.0;
    for t in -taps..=taps {
        let w = (-((t * t) as f32) / denom).exp();
        let texel = source.texel_clamped(x + t * dx, y + t * dy);
        for lane in 0..LANES {
            acc[lane] += w * texel[lane];
        }
        total += w;
    }
    acc.map(|v| v / total)
}

/// Horizontal half of a separable Gaussian blur. Uniform `sigma` in pixels.
pub fn blur_horizontal() -> KernelSource {
    KernelSource::new("blur-horizontal", 1, &["sigma"], |frag| {
        gaussian_pass(frag, 1, 0)
    })
}

/// Vertical half of a separable Gaussian blur.
pub fn blur_vertical() -> KernelSource {
    KernelSource::new("blur-vertical", 1, &["sigma"], |frag| {
        gaussian_pass(frag, 0, 1)
    })
}

/// `(l − mean) / sqrt(var + ε)` from luminance, local mean and local mean of
/// squares.
pub fn local_normalize() -> KernelSource {
    KernelSource::new("local-normalize", 3, &["epsilon"], |frag| {
        let eps = frag.scalar(0);
        let l = frag.here(0)[0];
        let mean = frag.here(1)[0];
        let mean_sq = frag.here(2)[0];
        let variance = (mean_sq - mean * mean).max(0.0);
        let n = (l - mean) / (variance + eps).sqrt();
        [n; LANES]
    })
}

/// Alpha-blends the foreground (input 0) over the background (input 1).
pub fn composite() -> KernelSource {
    KernelSource::new("composite", 2, &[], |frag| {
        let fg = frag.here(0);
        let bg = frag.here(1);
        let a = fg[3].clamp(0.0, 1.0);
        [
            fg[0] * a + bg[0] * (1.0 - a),
            fg[1] * a + bg[1] * (1.0 - a),
            fg[2] * a + bg[2] * (1.0 - a),
            1.0,
        ]
    })
}

/// Samples the source through a 2×3 affine map of centred coordinates.
///
/// Uniform `matrix` is `[a, b, c, d, tx, ty]`, mapping an output position
/// `p` (centred on the grid) to the source position `(a·px + b·py + tx,
/// c·px + d·py + ty)`. Positions outside the source read transparent black.
pub fn affine() -> KernelSource {
    KernelSource::new("affine", 1, &["matrix"], |frag| {
        let m = frag.vector(0);
        let (u, v) = frag.uv();
        let (px, py) = (u - 0.5, v - 0.5);
        let su = m[0] * px + m[1] * py + m[4] + 0.5;
        let sv = m[2] * px + m[3] * py + m[5] + 0.5;
        if !(0.0..=1.0).contains(&su) || !(0.0..=1.0).contains(&sv) {
            return [0.0; LANES];
        }
        frag.sample(0, su, sv)
    })
}

/// Sum of Gaussian-weighted displacement fields.
///
/// Uniform `fields` packs `[cx, cy, dx, dy, sigma]` per field in normalized
/// units. Output lanes 0–1 hold the summed displacement.
pub fn displacement() -> KernelSource {
    KernelSource::new("displacement", 0, &["fields"], |frag| {
        let fields = frag.vector(0);
        let (u, v) = frag.uv();
        let (mut ox, mut oy) = (0.0, 0.0);
        for field in fields.chunks_exact(5) {
            let (cx, cy, dx, dy, sigma) = (field[0], field[1], field[2], field[3], field[4]);
            let d2 = (u - cx) * (u - cx) + (v - cy) * (v - cy);
            let w = (-d2 / (2.0 * sigma * sigma).max(1e-6)).exp();
            ox += w * dx;
            oy += w * dy;
        }
        [ox, oy, 0.0, 0.0]
    })
}

/// Looks the source (input 0) up at `uv + offset`, with the offset read from
/// lanes 0–1 of input 1.
pub fn warp() -> KernelSource {
    KernelSource::new("warp", 2, &[], |frag| {
        let (u, v) = frag.uv();
        let offset = frag.here(1);
        frag.sample(0, u + offset[0], v + offset[1])
    })
}

/// Hue rotation (YIQ), gamma and luminosity shift; alpha is kept.
pub fn color_jitter() -> KernelSource {
    KernelSource::new("color-jitter", 1, &["hue", "gamma", "luminosity"], |frag| {
        let (hue, gamma, lum) = (frag.scalar(0), frag.scalar(1), frag.scalar(2));
        let c = frag.here(0);
        let y = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
        let i = 0.596 * c[0] - 0.274 * c[1] - 0.322 * c[2];
        let q = 0.211 * c[0] - 0.523 * c[1] + 0.312 * c[2];
        let (sin, cos) = hue.sin_cos();
        let (i, q) = (i * cos - q * sin, i * sin + q * cos);
        let rgb = [
            y + 0.956 * i + 0.621 * q,
            y - 0.272 * i - 0.647 * q,
            y - 1.106 * i + 1.703 * q,
        ]
        .map(|channel| (channel.max(0.0).powf(gamma) + lum).clamp(0.0, 1.0));
        [rgb[0], rgb[1], rgb[2], c[3]]
    })
}

fn hash(x: i64, y: i64, seed: u32) -> f32 {
    let mut h = (x as u32)
        .wrapping_mul(0x8da6_b343)
        ^ (y as u32).wrapping_mul(0xd816_3841)
        ^ seed.wrapping_mul(0xcb1a_b31f);
    h ^= h >> 13;
    h = h.wrapping_mul(0x5bd1_e995);
    h ^= h >> 15;
    (h & 0x00ff_ffff) as f32 / 16_777_216.0
}

fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

fn lerp_texel(a: &[f32], b: &[f32], t: f32) -> Texel {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Smooth value noise blending two colours.
pub fn value_noise() -> KernelSource {
    KernelSource::new(
        "value-noise",
        0,
        &["seed", "cells", "color_a", "color_b"],
        |frag| {
            let seed = frag.scalar(0) as u32;
            let cells = frag.scalar(1).max(1.0);
            let (u, v) = frag.uv();
            let (fx, fy) = (u * cells, v * cells);
            let (x0, y0) = (fx.floor(), fy.floor());
            let (tx, ty) = (smoothstep(fx - x0), smoothstep(fy - y0));
            let (x0, y0) = (x0 as i64, y0 as i64);
            let top = hash(x0, y0, seed) + (hash(x0 + 1, y0, seed) - hash(x0, y0, seed)) * tx;
            let bottom =
                hash(x0, y0 + 1, seed) + (hash(x0 + 1, y0 + 1, seed) - hash(x0, y0 + 1, seed)) * tx;
            lerp_texel(frag.vector(2), frag.vector(3), top + (bottom - top) * ty)
        },
    )
}

/// Linear gradient between two colours along direction `angle`.
pub fn linear_gradient() -> KernelSource {
    KernelSource::new(
        "linear-gradient",
        0,
        &["angle", "color_a", "color_b"],
        |frag| {
            let (sin, cos) = frag.scalar(0).sin_cos();
            let (u, v) = frag.uv();
            let t = ((u - 0.5) * cos + (v - 0.5) * sin + 0.5).clamp(0.0, 1.0);
            lerp_texel(frag.vector(1), frag.vector(2), t)
        },
    )
}
