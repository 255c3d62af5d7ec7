//! The compute device: buffer allocation, kernel compilation and draws.
//!
//! A draw renders every pixel of the output buffer independently, reading
//! only from the bound inputs and uniforms. Rows are rendered in parallel
//! with rayon; a call returns once the whole grid is written, so successive
//! draws execute in program order.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::parallel::prelude::*;
use ndarray::Axis;

use super::buffer::{Buffer, BufferSpec, Texel, LANES};
use crate::error::DeviceError;

/// Per-pixel shader body.
pub type Shader = dyn Fn(&Fragment<'_>) -> Texel + Send + Sync;

/// Uncompiled kernel: a named shader with its declared bindings.
#[derive(Clone)]
pub struct KernelSource {
    name: String,
    inputs: usize,
    uniforms: Vec<String>,
    shader: Arc<Shader>,
}

impl KernelSource {
    pub fn new<F>(name: impl Into<String>, inputs: usize, uniforms: &[&str], shader: F) -> Self
    where
        F: Fn(&Fragment<'_>) -> Texel + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs,
            uniforms: uniforms.iter().map(|name| name.to_string()).collect(),
            shader: Arc::new(shader),
        }
    }
}

/// A compiled kernel. Cheap to clone.
#[derive(Clone)]
pub struct Kernel {
    name: Arc<str>,
    inputs: usize,
    uniforms: Arc<[String]>,
    shader: Arc<Shader>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_count(&self) -> usize {
        self.inputs
    }

    pub fn uniform_names(&self) -> &[String] {
        &self.uniforms
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("uniforms", &self.uniforms)
            .finish()
    }
}

/// A uniform value bound for one draw.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Scalar(f32),
    Vector(Vec<f32>),
}

/// Named uniforms for one draw.
#[derive(Debug, Clone, Default)]
pub struct Uniforms {
    entries: Vec<(String, UniformValue)>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: &str, value: f32) -> Self {
        self.entries
            .push((name.to_string(), UniformValue::Scalar(value)));
        self
    }

    pub fn vector(mut self, name: &str, values: Vec<f32>) -> Self {
        self.entries
            .push((name.to_string(), UniformValue::Vector(values)));
        self
    }

    fn resolve<'a>(&'a self, kernel: &Kernel) -> Result<Vec<&'a UniformValue>, DeviceError> {
        if let Some((name, _)) = self
            .entries
            .iter()
            .find(|(name, _)| !kernel.uniforms.iter().any(|declared| declared == name))
        {
            return Err(DeviceError::UnknownUniform {
                kernel: kernel.name.to_string(),
                name: name.clone(),
            });
        }
        kernel
            .uniforms
            .iter()
            .map(|declared| {
                self.entries
                    .iter()
                    .rev()
                    .find(|(name, _)| name == declared)
                    .map(|(_, value)| value)
                    .ok_or_else(|| DeviceError::MissingUniform {
                        kernel: kernel.name.to_string(),
                        name: declared.clone(),
                    })
            })
            .collect()
    }
}

/// What a shader sees for the pixel it is computing.
pub struct Fragment<'a> {
    pub x: usize,
    pub y: usize,
    side: usize,
    inputs: &'a [&'a Buffer],
    uniforms: &'a [&'a UniformValue],
}

impl<'a> Fragment<'a> {
    /// Side of the output grid.
    #[inline]
    pub fn side(&self) -> usize {
        self.side
    }

    /// Normalized coordinates of the pixel centre.
    #[inline]
    pub fn uv(&self) -> (f32, f32) {
        let side = self.side as f32;
        ((self.x as f32 + 0.5) / side, (self.y as f32 + 0.5) / side)
    }

    /// Row-major index of the pixel being rendered.
    #[inline]
    pub fn pixel(&self) -> usize {
        self.y * self.side + self.x
    }

    #[inline]
    pub fn input(&self, slot: usize) -> &'a Buffer {
        self.inputs[slot]
    }

    /// Texel of input `slot` at the same coordinates as the output pixel.
    #[inline]
    pub fn here(&self, slot: usize) -> Texel {
        self.inputs[slot].texel(self.x, self.y)
    }

    #[inline]
    pub fn fetch(&self, slot: usize, x: usize, y: usize) -> Texel {
        self.inputs[slot].texel(x, y)
    }

    #[inline]
    pub fn sample(&self, slot: usize, u: f32, v: f32) -> Texel {
        self.inputs[slot].sample(u, v)
    }

    #[inline]
    pub fn scalar(&self, uniform: usize) -> f32 {
        match self.uniforms[uniform] {
            UniformValue::Scalar(value) => *value,
            UniformValue::Vector(values) => values.first().copied().unwrap_or(0.0),
        }
    }

    #[inline]
    pub fn vector(&self, uniform: usize) -> &'a [f32] {
        match self.uniforms[uniform] {
            UniformValue::Scalar(value) => std::slice::from_ref(value),
            UniformValue::Vector(values) => values,
        }
    }
}

/// The compute device.
#[derive(Debug)]
pub struct Device {
    label: String,
    lost: AtomicBool,
    draws: AtomicU64,
    allocations: AtomicU64,
}

impl Device {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            lost: AtomicBool::new(false),
            draws: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn ensure_alive(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(DeviceError::ContextLost);
        }
        Ok(())
    }

    /// Allocates a zero-filled buffer.
    pub fn allocate(&self, spec: BufferSpec) -> Result<Buffer, DeviceError> {
        self.ensure_alive()?;
        spec.validate()?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::zeroed(spec))
    }

    /// Validates a kernel source and produces a runnable kernel.
    pub fn compile(&self, source: KernelSource) -> Result<Kernel, DeviceError> {
        self.ensure_alive()?;
        if source.name.is_empty() {
            return Err(DeviceError::InvalidKernel {
                kernel: source.name,
                reason: "kernel name is empty".into(),
            });
        }
        for (index, name) in source.uniforms.iter().enumerate() {
            if name.is_empty() {
                return Err(DeviceError::InvalidKernel {
                    kernel: source.name.clone(),
                    reason: format!("uniform #{index} has an empty name"),
                });
            }
            if source.uniforms[..index].contains(name) {
                return Err(DeviceError::InvalidKernel {
                    kernel: source.name.clone(),
                    reason: format!("uniform '{name}' declared twice"),
                });
            }
        }
        Ok(Kernel {
            name: Arc::from(source.name),
            inputs: source.inputs,
            uniforms: Arc::from(source.uniforms),
            shader: source.shader,
        })
    }

    /// Renders `kernel` over every pixel of `output`.
    pub fn run(
        &self,
        kernel: &Kernel,
        inputs: &[&Buffer],
        output: &mut Buffer,
        uniforms: &Uniforms,
    ) -> Result<(), DeviceError> {
        self.ensure_alive()?;
        if inputs.len() != kernel.inputs {
            return Err(DeviceError::InputCount {
                kernel: kernel.name.to_string(),
                expected: kernel.inputs,
                got: inputs.len(),
            });
        }
        let values = uniforms.resolve(kernel)?;
        let side = output.side();
        let shader = kernel.shader.as_ref();

        output
            .data
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(y, mut row)| {
                for x in 0..side {
                    let fragment = Fragment {
                        x,
                        y,
                        side,
                        inputs,
                        uniforms: &values,
                    };
                    let texel = shader(&fragment);
                    for lane in 0..LANES {
                        row[[x, lane]] = texel[lane];
                    }
                }
            });
        output.finish_write();
        self.draws.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Synchronous readback of packed slots.
    pub fn read(&self, buffer: &Buffer) -> Result<Vec<f32>, DeviceError> {
        self.ensure_alive()?;
        Ok(buffer.to_vec())
    }

    /// Marks the context as lost. Every later call fails.
    pub fn lose(&self) {
        tracing::error!(device = %self.label, "compute context lost");
        self.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn draw_calls(&self) -> u64 {
        self.draws.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

/// Checks that `buffer` has the side a kernel binding expects.
pub fn expect_side(buffer: &Buffer, expected: usize, context: &str) -> Result<(), DeviceError> {
    if buffer.side() != expected {
        return Err(DeviceError::SideMismatch {
            expected,
            got: buffer.side(),
            context: context.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_source() -> KernelSource {
        KernelSource::new("add-scaled", 2, &["scale"], |frag| {
            let a = frag.here(0);
            let b = frag.here(1);
            let k = frag.scalar(0);
            [
                a[0] + k * b[0],
                a[1] + k * b[1],
                a[2] + k * b[2],
                a[3] + k * b[3],
            ]
        })
    }

    #[test]
    fn test_run_overwrites_every_pixel() {
        let device = Device::new("test");
        let kernel = device.compile(add_source()).unwrap();
        let mut a = device.allocate(BufferSpec::new(3)).unwrap();
        let mut b = device.allocate(BufferSpec::new(3)).unwrap();
        a.upload(&vec![1.0; 36]).unwrap();
        b.upload(&vec![2.0; 36]).unwrap();
        let mut out = device.allocate(BufferSpec::new(3)).unwrap();
        out.upload(&vec![99.0; 36]).unwrap();

        device
            .run(&kernel, &[&a, &b], &mut out, &Uniforms::new().scalar("scale", 0.5))
            .unwrap();
        assert!(out.to_vec().iter().all(|&v| (v - 2.0).abs() < 1e-6));
        assert_eq!(device.draw_calls(), 1);
    }

    #[test]
    fn test_uniform_validation() {
        let device = Device::new("test");
        let kernel = device.compile(add_source()).unwrap();
        let a = device.allocate(BufferSpec::new(1)).unwrap();
        let b = device.allocate(BufferSpec::new(1)).unwrap();
        let mut out = device.allocate(BufferSpec::new(1)).unwrap();

        let missing = device.run(&kernel, &[&a, &b], &mut out, &Uniforms::new());
        assert!(matches!(missing, Err(DeviceError::MissingUniform { .. })));

        let unknown = device.run(
            &kernel,
            &[&a, &b],
            &mut out,
            &Uniforms::new().scalar("scale", 1.0).scalar("gain", 2.0),
        );
        assert!(matches!(unknown, Err(DeviceError::UnknownUniform { .. })));
    }

    #[test]
    fn test_input_count_validation() {
        let device = Device::new("test");
        let kernel = device.compile(add_source()).unwrap();
        let a = device.allocate(BufferSpec::new(1)).unwrap();
        let mut out = device.allocate(BufferSpec::new(1)).unwrap();
        let err = device
            .run(&kernel, &[&a], &mut out, &Uniforms::new().scalar("scale", 1.0))
            .unwrap_err();
        assert!(matches!(err, DeviceError::InputCount { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_compile_rejects_duplicate_uniforms() {
        let device = Device::new("test");
        let source = KernelSource::new("dup", 0, &["a", "a"], |_| [0.0; 4]);
        assert!(matches!(
            device.compile(source),
            Err(DeviceError::InvalidKernel { .. })
        ));
    }

    #[test]
    fn test_context_loss_is_sticky() {
        let device = Device::new("test");
        let kernel = device.compile(add_source()).unwrap();
        let a = device.allocate(BufferSpec::new(1)).unwrap();
        let b = device.allocate(BufferSpec::new(1)).unwrap();
        let mut out = device.allocate(BufferSpec::new(1)).unwrap();
        device.lose();
        assert!(device.is_lost());
        let uniforms = Uniforms::new().scalar("scale", 1.0);
        assert_eq!(
            device.run(&kernel, &[&a, &b], &mut out, &uniforms),
            Err(DeviceError::ContextLost)
        );
        assert_eq!(device.read(&out), Err(DeviceError::ContextLost));
        assert!(device.allocate(BufferSpec::new(1)).is_err());
    }

    #[test]
    fn test_fragment_coordinates() {
        let device = Device::new("test");
        let kernel = device
            .compile(KernelSource::new("coords", 0, &[], |frag| {
                let (u, v) = frag.uv();
                [frag.x as f32, frag.y as f32, u, v]
            }))
            .unwrap();
        let mut out = device.allocate(BufferSpec::new(4)).unwrap();
        device.run(&kernel, &[], &mut out, &Uniforms::new()).unwrap();
        assert_eq!(out.texel(3, 1), [3.0, 1.0, 0.875, 0.375]);
    }
}
