//! Cost functions: output delta kernels and the masked error metric.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, DeviceError};
use crate::layer::Activation;
use crate::substrate::{slot_index, Buffer, BufferSpec, ComputeContext, KernelSource, Uniforms, LANES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cost {
    /// `½(o − e)²`; delta `(o − e)·f'(pre)`.
    #[default]
    Quadratic,
    /// Binary cross-entropy on sigmoid outputs; delta `o − e`.
    CrossEntropy,
}

impl Cost {
    pub fn name(self) -> &'static str {
        match self {
            Cost::Quadratic => "quadratic",
            Cost::CrossEntropy => "crossEntropy",
        }
    }

    /// Rejects cost/activation pairs whose delta would be wrong.
    pub fn check(self, output: Activation) -> Result<(), ConfigurationError> {
        if self == Cost::CrossEntropy && output != Activation::Sigmoid {
            return Err(ConfigurationError::IncompatibleCost {
                cost: self.name().into(),
                reason: format!(
                    "requires a sigmoid output layer, found {}",
                    output.name()
                ),
            });
        }
        Ok(())
    }

    /// Output delta kernel.
    ///
    /// Inputs: output, expected, delta mask, clamp mask, pre-activation.
    /// A clamped slot is a one-sided target: it gets no delta once the output
    /// has reached its expected value in the direction of that value.
    pub fn delta_kernel(self, activation: Activation) -> KernelSource {
        KernelSource::new(
            format!("cost-{}-{}", self.name(), activation.name()),
            5,
            &["active"],
            move |frag| {
                let active = frag.scalar(0) as usize;
                let (o, e, mask, clamp, pre) = (
                    frag.here(0),
                    frag.here(1),
                    frag.here(2),
                    frag.here(3),
                    frag.here(4),
                );
                let mut delta = [0.0; LANES];
                for lane in 0..LANES {
                    if slot_index(frag.x, frag.y, lane, frag.side()) >= active {
                        continue;
                    }
                    let satisfied = clamp[lane] > 0.5
                        && ((e[lane] >= 0.5 && o[lane] >= e[lane])
                            || (e[lane] < 0.5 && o[lane] <= e[lane]));
                    if satisfied {
                        continue;
                    }
                    let error = o[lane] - e[lane];
                    let slope = match self {
                        Cost::Quadratic => activation.derivative(pre[lane], o[lane]),
                        Cost::CrossEntropy => 1.0,
                    };
                    delta[lane] = error * slope * mask[lane];
                }
                delta
            },
        )
    }
}

/// Scratch for [`masked_error`].
#[derive(Debug)]
pub struct ErrorScratch {
    squared: Buffer,
}

impl ErrorScratch {
    pub fn new(ctx: &ComputeContext, side: usize) -> Result<Self, DeviceError> {
        let mut spec = BufferSpec::new(side);
        if side.is_power_of_two() {
            spec = spec.mipmapped();
        }
        Ok(Self {
            squared: ctx.device.allocate(spec)?,
        })
    }
}

/// Sum of `(o − e)²` over masked slots divided by the number of masked
/// slots. Power-of-two sides reduce through the mip chain.
pub fn masked_error(
    ctx: &ComputeContext,
    scratch: &mut ErrorScratch,
    output: &Buffer,
    expected: &Buffer,
    mask: &Buffer,
) -> Result<f32, DeviceError> {
    ctx.device.run(
        &ctx.kernels.masked_squared_error,
        &[output, expected, mask],
        &mut scratch.squared,
        &Uniforms::new(),
    )?;
    let total: f32 = scratch.squared.lane_sums().iter().sum();
    let count: f32 = mask.lane_sums().iter().sum();
    if count <= 0.0 {
        return Ok(0.0);
    }
    Ok(total / count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_delta(cost: Cost, output: [f32; 4], expected: [f32; 4], clamp: [f32; 4]) -> Vec<f32> {
        let ctx = ComputeContext::new("test").unwrap();
        let kernel = ctx.device.compile(cost.delta_kernel(Activation::Sigmoid)).unwrap();
        let mut o = ctx.buffer(1).unwrap();
        o.upload(&output).unwrap();
        let mut e = ctx.buffer(1).unwrap();
        e.upload(&expected).unwrap();
        let mut m = ctx.buffer(1).unwrap();
        ctx.fill(&mut m, [1.0; 4]).unwrap();
        let mut c = ctx.buffer(1).unwrap();
        c.upload(&clamp).unwrap();
        let pre = ctx.buffer(1).unwrap();
        let mut delta = ctx.buffer(1).unwrap();
        ctx.device
            .run(
                &kernel,
                &[&o, &e, &m, &c, &pre],
                &mut delta,
                &Uniforms::new().scalar("active", 4.0),
            )
            .unwrap();
        delta.to_vec()
    }

    #[test]
    fn test_cross_entropy_delta_is_plain_error() {
        let delta = run_delta(
            Cost::CrossEntropy,
            [0.8, 0.2, 0.5, 0.5],
            [1.0, 0.0, 0.0, 1.0],
            [0.0; 4],
        );
        let expected = [-0.2, 0.2, 0.5, -0.5];
        for (d, e) in delta.iter().zip(expected) {
            assert!((d - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_clamp_silences_satisfied_one_sided_targets() {
        let delta = run_delta(
            Cost::CrossEntropy,
            [1.2, 0.7, -0.3, 0.4],
            [1.0, 1.0, 0.0, 0.0],
            [1.0; 4],
        );
        assert_eq!(delta[0], 0.0);
        assert!((delta[1] + 0.3).abs() < 1e-6);
        assert_eq!(delta[2], 0.0);
        assert!((delta[3] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_quadratic_uses_activation_slope() {
        // sigmoid slope at out = 0.5 is 0.25
        let delta = run_delta(Cost::Quadratic, [0.5; 4], [1.0; 4], [0.0; 4]);
        assert!(delta.iter().all(|d| (d + 0.125).abs() < 1e-6));
    }

    #[test]
    fn test_cross_entropy_needs_sigmoid() {
        assert!(Cost::CrossEntropy.check(Activation::Linear).is_err());
        assert!(Cost::CrossEntropy.check(Activation::Sigmoid).is_ok());
        assert!(Cost::Quadratic.check(Activation::Tanh).is_ok());
    }

    #[test]
    fn test_masked_error_averages_over_mask() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut scratch = ErrorScratch::new(&ctx, 2).unwrap();
        let mut output = ctx.buffer(2).unwrap();
        output.upload(&[1.0, 2.0, 0.0, 0.0]).unwrap();
        let expected = ctx.buffer(2).unwrap();
        let mut mask = ctx.buffer(2).unwrap();
        mask.upload(&[1.0, 1.0]).unwrap();
        let error = masked_error(&ctx, &mut scratch, &output, &expected, &mask).unwrap();
        assert!((error - 2.5).abs() < 1e-5);
    }
}
