//! Procedural backgrounds drawn behind synthetic samples.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::substrate::{expect_side, Buffer, ComputeContext, Uniforms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundKind {
    /// Smooth value noise between two random colours.
    #[default]
    Noise,
    /// Linear gradient at a random angle.
    Gradient,
    /// A single random colour.
    Flat,
    /// One of the above, picked per sample.
    Mixed,
}

/// Renders random backgrounds of a fixed side.
#[derive(Debug, Clone)]
pub struct BackgroundSource {
    kind: BackgroundKind,
    side: usize,
}

fn random_color(rng: &mut StdRng) -> Vec<f32> {
    vec![rng.gen(), rng.gen(), rng.gen(), 1.0]
}

impl BackgroundSource {
    pub fn new(kind: BackgroundKind, side: usize) -> Self {
        Self { kind, side }
    }

    pub fn kind(&self) -> BackgroundKind {
        self.kind
    }

    pub fn render(
        &self,
        ctx: &ComputeContext,
        rng: &mut StdRng,
        target: &mut Buffer,
    ) -> Result<(), DeviceError> {
        expect_side(target, self.side, "background")?;
        let kind = match self.kind {
            BackgroundKind::Mixed => match rng.gen_range(0..3) {
                0 => BackgroundKind::Noise,
                1 => BackgroundKind::Gradient,
                _ => BackgroundKind::Flat,
            },
            kind => kind,
        };
        match kind {
            BackgroundKind::Noise => {
                let uniforms = Uniforms::new()
                    .scalar("seed", rng.gen_range(0..1 << 20) as f32)
                    .scalar("cells", rng.gen_range(2.0..8.0))
                    .vector("color_a", random_color(rng))
                    .vector("color_b", random_color(rng));
                ctx.device.run(&ctx.kernels.value_noise, &[], target, &uniforms)
            }
            BackgroundKind::Gradient => {
                let uniforms = Uniforms::new()
                    .scalar("angle", rng.gen_range(0.0..std::f32::consts::TAU))
                    .vector("color_a", random_color(rng))
                    .vector("color_b", random_color(rng));
                ctx.device
                    .run(&ctx.kernels.linear_gradient, &[], target, &uniforms)
            }
            BackgroundKind::Flat | BackgroundKind::Mixed => {
                let color = random_color(rng);
                ctx.fill(target, [color[0], color[1], color[2], 1.0])
            }
        }
    }
}
