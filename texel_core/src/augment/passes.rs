//! Individual augmentation passes.

use rand::rngs::StdRng;
use rand::Rng;

use super::AugmentationKind;
use crate::error::DeviceError;
use crate::problem::BackgroundSource;
use crate::substrate::{Buffer, BufferSpec, ComputeContext, Uniforms};

fn uniform(rng: &mut StdRng, range: [f32; 2]) -> f32 {
    if range[1] > range[0] {
        rng.gen_range(range[0]..=range[1])
    } else {
        range[0]
    }
}

fn symmetric(rng: &mut StdRng, extent: f32) -> f32 {
    if extent > 0.0 {
        rng.gen_range(-extent..=extent)
    } else {
        0.0
    }
}

/// Inverse of `scale · rotate(angle) · flip` followed by `translate`, as the
/// `[a, b, c, d, tx, ty]` output→source map the affine kernel expects.
pub fn inverse_affine(scale: f32, angle: f32, flip: bool, translate: (f32, f32)) -> [f32; 6] {
    let (sin, cos) = angle.sin_cos();
    let f = if flip { -1.0 } else { 1.0 };
    let inv = 1.0 / scale;
    let (a, b) = (f * cos * inv, f * sin * inv);
    let (c, d) = (-sin * inv, cos * inv);
    let (tx, ty) = translate;
    [a, b, c, d, -(a * tx + b * ty), -(c * tx + d * ty)]
}

/// A pass with its scratch buffers.
#[derive(Debug)]
pub(crate) enum Pass {
    Composite {
        source: BackgroundSource,
        background: Buffer,
    },
    Affine {
        scale: [f32; 2],
        rotation: [f32; 2],
        translation: f32,
        flip: bool,
    },
    Blur {
        sigma: [f32; 2],
        scratch: Buffer,
    },
    Elastic {
        fields: usize,
        magnitude: f32,
        radius: [f32; 2],
        offsets: Buffer,
    },
    ColorJitter {
        hue: f32,
        gamma: f32,
        luminosity: f32,
    },
}

impl Pass {
    pub fn build(ctx: &ComputeContext, kind: &AugmentationKind, side: usize) -> Result<Self, DeviceError> {
        let spec = BufferSpec::new(side).interpolated();
        Ok(match *kind {
            AugmentationKind::Composite { background } => Pass::Composite {
                source: BackgroundSource::new(background, side),
                background: ctx.device.allocate(spec)?,
            },
            AugmentationKind::Affine {
                scale,
                rotation,
                translation,
                flip,
            } => Pass::Affine {
                scale,
                rotation,
                translation,
                flip,
            },
            AugmentationKind::Blur { sigma } => Pass::Blur {
                sigma,
                scratch: ctx.device.allocate(spec)?,
            },
            AugmentationKind::Elastic {
                fields,
                magnitude,
                radius,
            } => Pass::Elastic {
                fields,
                magnitude,
                radius,
                offsets: ctx.device.allocate(BufferSpec::new(side))?,
            },
            AugmentationKind::ColorJitter {
                hue,
                gamma,
                luminosity,
            } => Pass::ColorJitter {
                hue,
                gamma,
                luminosity,
            },
        })
    }

    /// Renders `source` transformed into `target`.
    pub fn apply(
        &mut self,
        ctx: &ComputeContext,
        rng: &mut StdRng,
        source: &Buffer,
        target: &mut Buffer,
    ) -> Result<(), DeviceError> {
        let device = &ctx.device;
        match self {
            Pass::Composite {
                source: backgrounds,
                background,
            } => {
                backgrounds.render(ctx, rng, background)?;
                device.run(
                    &ctx.kernels.composite,
                    &[source, &*background],
                    target,
                    &Uniforms::new(),
                )
            }
            Pass::Affine {
                scale,
                rotation,
                translation,
                flip,
            } => {
                let s = uniform(rng, *scale).max(1e-3);
                let angle = uniform(rng, *rotation).to_radians();
                let flipped = *flip && rng.gen_bool(0.5);
                let shift = (symmetric(rng, *translation), symmetric(rng, *translation));
                let matrix = inverse_affine(s, angle, flipped, shift);
                device.run(
                    &ctx.kernels.affine,
                    &[source],
                    target,
                    &Uniforms::new().vector("matrix", matrix.to_vec()),
                )
            }
            Pass::Blur { sigma, scratch } => {
                let sigma = uniform(rng, *sigma);
                ctx.kernels
                    .gaussian_blur(device, source, scratch, target, sigma)
            }
            Pass::Elastic {
                fields,
                magnitude,
                radius,
                offsets,
            } => {
                let mut packed = Vec::with_capacity(*fields * 5);
                for _ in 0..*fields {
                    packed.extend([
                        rng.gen::<f32>(),
                        rng.gen::<f32>(),
                        symmetric(rng, *magnitude),
                        symmetric(rng, *magnitude),
                        uniform(rng, *radius),
                    ]);
                }
                device.run(
                    &ctx.kernels.displacement,
                    &[],
                    offsets,
                    &Uniforms::new().vector("fields", packed),
                )?;
                device.run(&ctx.kernels.warp, &[source, &*offsets], target, &Uniforms::new())
            }
            Pass::ColorJitter {
                hue,
                gamma,
                luminosity,
            } => {
                let uniforms = Uniforms::new()
                    .scalar("hue", symmetric(rng, *hue) * std::f32::consts::TAU)
                    .scalar("gamma", (1.0 + symmetric(rng, *gamma)).max(0.1))
                    .scalar("luminosity", symmetric(rng, *luminosity));
                device.run(&ctx.kernels.color_jitter, &[source], target, &uniforms)
            }
        }
    }
}
