//! Compute substrate: buffers, kernels and the device that runs them.
//!
//! Everything the engine computes goes through [`Device::run`]: "draw into
//! buffer X using kernel K over bound inputs". The [`ComputeContext`] bundles
//! a device with the compiled [`KernelLibrary`] and is shared by every layer,
//! pass and provider of a session.

pub mod buffer;
pub mod device;
#[cfg(feature = "gpu")]
pub mod wgpu_mirror;

use std::sync::Arc;

pub use buffer::{slot_index, slot_position, Buffer, BufferSpec, Filtering, Precision, Texel, LANES};
pub use device::{expect_side, Device, Fragment, Kernel, KernelSource, UniformValue, Uniforms};

use crate::error::DeviceError;
use crate::kernels::KernelLibrary;

/// A device plus its compiled kernel catalog.
#[derive(Debug)]
pub struct ComputeContext {
    pub device: Device,
    pub kernels: KernelLibrary,
}

impl ComputeContext {
    pub fn new(label: impl Into<String>) -> Result<Arc<Self>, DeviceError> {
        let device = Device::new(label);
        let kernels = KernelLibrary::compile(&device)?;
        Ok(Arc::new(Self { device, kernels }))
    }

    /// Allocates a buffer of `side` with default attributes.
    pub fn buffer(&self, side: usize) -> Result<Buffer, DeviceError> {
        self.device.allocate(BufferSpec::new(side))
    }

    /// Copies `source` into `target`.
    pub fn copy(&self, source: &Buffer, target: &mut Buffer) -> Result<(), DeviceError> {
        expect_side(source, target.side(), "copy")?;
        self.device
            .run(&self.kernels.copy, &[source], target, &Uniforms::new())
    }

    /// Fills `target` with a constant texel.
    pub fn fill(&self, target: &mut Buffer, value: Texel) -> Result<(), DeviceError> {
        self.device.run(
            &self.kernels.fill,
            &[],
            target,
            &Uniforms::new().vector("value", value.to_vec()),
        )
    }
}

/// A pair of same-shaped buffers rendered alternately.
///
/// Kernels may not read their own target, so in-place updates render into
/// `back` from `front` and then swap.
#[derive(Debug, Clone)]
pub struct PingPong {
    front: Buffer,
    back: Buffer,
}

impl PingPong {
    pub fn new(device: &Device, spec: BufferSpec) -> Result<Self, DeviceError> {
        Ok(Self {
            front: device.allocate(spec)?,
            back: device.allocate(spec)?,
        })
    }

    pub fn front(&self) -> &Buffer {
        &self.front
    }

    /// Host-side access to the current value (uploads, restores).
    pub fn front_mut(&mut self) -> &mut Buffer {
        &mut self.front
    }

    /// Current value and the render target for the next value.
    pub fn split(&mut self) -> (&Buffer, &mut Buffer) {
        (&self.front, &mut self.back)
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    pub fn side(&self) -> usize {
        self.front.side()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_swaps() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut pair = PingPong::new(&ctx.device, BufferSpec::new(2)).unwrap();
        {
            let (front, back) = pair.split();
            ctx.fill(back, [1.0, 2.0, 3.0, 4.0]).unwrap();
            assert_eq!(front.texel(0, 0), [0.0; 4]);
        }
        pair.swap();
        assert_eq!(pair.front().texel(1, 1), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_copy_checks_sides() {
        let ctx = ComputeContext::new("test").unwrap();
        let source = ctx.buffer(2).unwrap();
        let mut target = ctx.buffer(3).unwrap();
        assert!(matches!(
            ctx.copy(&source, &mut target),
            Err(DeviceError::SideMismatch { .. })
        ));
    }
}
