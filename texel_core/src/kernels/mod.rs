//! Catalog of reusable kernels compiled once per compute context.
//!
//! Layer-specific kernels (connectivity wiring, activations, cost deltas)
//! are compiled by their owners at construction time; everything shared by
//! several components lives here.

pub mod elementwise;
pub mod image;

use crate::error::DeviceError;
use crate::substrate::{Buffer, Device, Kernel, Uniforms};

/// Compiled shared kernels.
#[derive(Debug, Clone)]
pub struct KernelLibrary {
    pub copy: Kernel,
    pub fill: Kernel,
    pub scale_offset: Kernel,
    pub add: Kernel,
    pub multiply: Kernel,
    pub momentum_velocity: Kernel,
    pub masked_squared_error: Kernel,
    pub neuron_mask: Kernel,
    pub grayscale: Kernel,
    pub blur_horizontal: Kernel,
    pub blur_vertical: Kernel,
    pub local_normalize: Kernel,
    pub composite: Kernel,
    pub affine: Kernel,
    pub displacement: Kernel,
    pub warp: Kernel,
    pub color_jitter: Kernel,
    pub value_noise: Kernel,
    pub linear_gradient: Kernel,
}

impl KernelLibrary {
    pub fn compile(device: &Device) -> Result<Self, DeviceError> {
        let library = Self {
            copy: device.compile(elementwise::copy())?,
            fill: device.compile(elementwise::fill())?,
            scale_offset: device.compile(elementwise::scale_offset())?,
            add: device.compile(elementwise::add())?,
            multiply: device.compile(elementwise::multiply())?,
            momentum_velocity: device.compile(elementwise::momentum_velocity())?,
            masked_squared_error: device.compile(elementwise::masked_squared_error())?,
            neuron_mask: device.compile(elementwise::neuron_mask())?,
            grayscale: device.compile(image::grayscale())?,
            blur_horizontal: device.compile(image::blur_horizontal())?,
            blur_vertical: device.compile(image::blur_vertical())?,
            local_normalize: device.compile(image::local_normalize())?,
            composite: device.compile(image::composite())?,
            affine: device.compile(image::affine())?,
            displacement: device.compile(image::displacement())?,
            warp: device.compile(image::warp())?,
            color_jitter: device.compile(image::color_jitter())?,
            value_noise: device.compile(image::value_noise())?,
            linear_gradient: device.compile(image::linear_gradient())?,
        };
        tracing::debug!(device = device.label(), "kernel library compiled");
        Ok(library)
    }

    /// Separable Gaussian blur of `source` into `target` through `scratch`.
    pub fn gaussian_blur(
        &self,
        device: &Device,
        source: &Buffer,
        scratch: &mut Buffer,
        target: &mut Buffer,
        sigma: f32,
    ) -> Result<(), DeviceError> {
        let uniforms = Uniforms::new().scalar("sigma", sigma);
        device.run(&self.blur_horizontal, &[source], scratch, &uniforms)?;
        device.run(&self.blur_vertical, &[scratch], target, &uniforms)
    }
}

#[cfg(test)]
mod tests {
    use crate::substrate::{BufferSpec, ComputeContext, Uniforms};

    #[test]
    fn test_blur_preserves_constant_image() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut source = ctx.buffer(8).unwrap();
        ctx.fill(&mut source, [0.25, 0.5, 0.75, 1.0]).unwrap();
        let mut scratch = ctx.buffer(8).unwrap();
        let mut target = ctx.buffer(8).unwrap();
        ctx.kernels
            .gaussian_blur(&ctx.device, &source, &mut scratch, &mut target, 2.0)
            .unwrap();
        for value in target.to_vec().chunks(4) {
            assert!((value[0] - 0.25).abs() < 1e-5);
            assert!((value[3] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_blur_spreads_impulse() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut source = ctx.buffer(9).unwrap();
        source.set_texel(4, 4, [1.0; 4]);
        let mut scratch = ctx.buffer(9).unwrap();
        let mut target = ctx.buffer(9).unwrap();
        ctx.kernels
            .gaussian_blur(&ctx.device, &source, &mut scratch, &mut target, 1.0)
            .unwrap();
        let centre = target.texel(4, 4)[0];
        let neighbour = target.texel(5, 4)[0];
        assert!(centre < 1.0 && centre > neighbour && neighbour > 0.0);
        let total: f32 = target.lane_sums()[0];
        assert!((total - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_neuron_mask_zeroes_inactive_slots() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut source = ctx.buffer(2).unwrap();
        ctx.fill(&mut source, [1.0; 4]).unwrap();
        let mut target = ctx.buffer(2).unwrap();
        ctx.device
            .run(
                &ctx.kernels.neuron_mask,
                &[&source],
                &mut target,
                &Uniforms::new().scalar("active", 6.0),
            )
            .unwrap();
        let values = target.to_vec();
        assert_eq!(values[..6], [1.0; 6]);
        assert!(values[6..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_affine_identity_and_out_of_bounds() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut source = ctx.device.allocate(BufferSpec::new(4)).unwrap();
        source.set_texel(1, 2, [0.5; 4]);
        let mut target = ctx.buffer(4).unwrap();
        let identity = vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        ctx.device
            .run(
                &ctx.kernels.affine,
                &[&source],
                &mut target,
                &Uniforms::new().vector("matrix", identity),
            )
            .unwrap();
        assert_eq!(target.texel(1, 2), [0.5; 4]);

        ctx.fill(&mut source, [1.0; 4]).unwrap();
        let shifted = vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0];
        ctx.device
            .run(
                &ctx.kernels.affine,
                &[&source],
                &mut target,
                &Uniforms::new().vector("matrix", shifted),
            )
            .unwrap();
        assert_eq!(target.texel(0, 0), [0.0; 4]);
    }
}
