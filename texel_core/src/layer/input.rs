//! The input layer: optional curriculum blur and preprocessing.

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::substrate::{expect_side, Buffer, BufferSpec, ComputeContext, Precision, Uniforms};

/// Standard deviation, in pixels, of the neighbourhood used by local
/// normalisation.
pub const LOCAL_NORM_SIGMA: f32 = 2.0;
const LOCAL_NORM_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Preprocessing {
    #[default]
    None,
    Grayscale,
    /// Grayscale followed by subtraction of the local mean and division by
    /// the local standard deviation.
    GrayscaleLocalNorm,
}

#[derive(Debug)]
pub struct InputLayer {
    side: usize,
    neurons: usize,
    preprocessing: Preprocessing,
    precision: Precision,
    staged: Buffer,
    output: Buffer,
    blur_scratch: Buffer,
    blurred: Buffer,
    norm: Option<[Buffer; 4]>,
}

impl InputLayer {
    pub fn new(
        ctx: &ComputeContext,
        side: usize,
        neurons: usize,
        preprocessing: Preprocessing,
        precision: Precision,
    ) -> Result<Self, DeviceError> {
        let spec = BufferSpec::new(side);
        let norm = match preprocessing {
            Preprocessing::GrayscaleLocalNorm => Some([
                ctx.device.allocate(spec)?,
                ctx.device.allocate(spec)?,
                ctx.device.allocate(spec)?,
                ctx.device.allocate(spec)?,
            ]),
            _ => None,
        };
        Ok(Self {
            side,
            neurons,
            preprocessing,
            precision,
            staged: ctx.device.allocate(spec)?,
            output: ctx.device.allocate(spec.with_precision(precision))?,
            blur_scratch: ctx.device.allocate(spec)?,
            blurred: ctx.device.allocate(spec)?,
            norm,
        })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn neurons(&self) -> usize {
        self.neurons
    }

    pub fn preprocessing(&self) -> Preprocessing {
        self.preprocessing
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn output(&self) -> &Buffer {
        &self.output
    }

    /// Blurs (when `blur_sigma > 0`) and preprocesses `input` into the layer
    /// output.
    pub fn forward(
        &mut self,
        ctx: &ComputeContext,
        input: &Buffer,
        blur_sigma: f32,
    ) -> Result<(), DeviceError> {
        expect_side(input, self.side, "input layer")?;
        let source = if blur_sigma > 0.0 {
            ctx.kernels.gaussian_blur(
                &ctx.device,
                input,
                &mut self.blur_scratch,
                &mut self.blurred,
                blur_sigma,
            )?;
            &self.blurred
        } else {
            input
        };

        let none = Uniforms::new();
        match (self.preprocessing, self.norm.as_mut()) {
            (Preprocessing::GrayscaleLocalNorm, Some([lum, mean, squared, mean_sq])) => {
                ctx.device.run(&ctx.kernels.grayscale, &[source], lum, &none)?;
                ctx.kernels.gaussian_blur(
                    &ctx.device,
                    lum,
                    &mut self.blur_scratch,
                    mean,
                    LOCAL_NORM_SIGMA,
                )?;
                ctx.device.run(&ctx.kernels.multiply, &[&*lum, &*lum], squared, &none)?;
                ctx.kernels.gaussian_blur(
                    &ctx.device,
                    squared,
                    &mut self.blur_scratch,
                    mean_sq,
                    LOCAL_NORM_SIGMA,
                )?;
                ctx.device.run(
                    &ctx.kernels.local_normalize,
                    &[&*lum, &*mean, &*mean_sq],
                    &mut self.staged,
                    &Uniforms::new().scalar("epsilon", LOCAL_NORM_EPSILON),
                )?;
            }
            (Preprocessing::Grayscale, _) | (Preprocessing::GrayscaleLocalNorm, None) => {
                ctx.device
                    .run(&ctx.kernels.grayscale, &[source], &mut self.staged, &none)?;
            }
            (Preprocessing::None, _) => {
                ctx.device.run(&ctx.kernels.copy, &[source], &mut self.staged, &none)?;
            }
        }

        ctx.device.run(
            &ctx.kernels.neuron_mask,
            &[&self.staged],
            &mut self.output,
            &Uniforms::new().scalar("active", self.neurons as f32),
        )
    }
}
