//! Momentum SGD over weight buffers.
//!
//! Every trainable buffer (connectivity weights and layer biases) carries a
//! [`WeightState`]: the weights themselves, the gradient accumulated over the
//! current minibatch and the momentum velocity. The update rule is
//!
//! ```text
//! velocity = momentum * velocity - learning_rate * (gradient / batch + l2 * weights)
//! weights  = weights + velocity
//! ```
//!
//! after which the gradient is cleared for the next minibatch.

use crate::error::DeviceError;
use crate::substrate::{Buffer, BufferSpec, ComputeContext, PingPong, Uniforms};

/// Hyperparameters of one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateStep {
    pub learning_rate: f32,
    pub l2_decay: f32,
    pub momentum: f32,
    /// Number of samples accumulated into the gradient.
    pub batch: usize,
}

impl UpdateStep {
    /// Same step without weight decay (biases).
    pub fn without_decay(self) -> Self {
        Self {
            l2_decay: 0.0,
            ..self
        }
    }
}

/// Weights, accumulated gradient and velocity of one trainable buffer.
#[derive(Debug, Clone)]
pub struct WeightState {
    weights: PingPong,
    gradient: PingPong,
    velocity: PingPong,
}

impl WeightState {
    /// Allocates a zeroed state. Gradients and velocities always use full
    /// precision; the weights use `spec`.
    pub fn new(ctx: &ComputeContext, spec: BufferSpec) -> Result<Self, DeviceError> {
        let accumulator = BufferSpec::new(spec.side);
        Ok(Self {
            weights: PingPong::new(&ctx.device, spec)?,
            gradient: PingPong::new(&ctx.device, accumulator)?,
            velocity: PingPong::new(&ctx.device, accumulator)?,
        })
    }

    pub fn side(&self) -> usize {
        self.weights.side()
    }

    pub fn weights(&self) -> &Buffer {
        self.weights.front()
    }

    pub fn gradient(&self) -> &Buffer {
        self.gradient.front()
    }

    /// Replaces the weights with host values and clears optimizer state.
    pub fn load(&mut self, ctx: &ComputeContext, values: &[f32]) -> Result<(), DeviceError> {
        self.weights.front_mut().upload(values)?;
        self.reset_optimizer(ctx)
    }

    /// Zeroes the accumulated gradient and the velocity.
    pub fn reset_optimizer(&mut self, ctx: &ComputeContext) -> Result<(), DeviceError> {
        ctx.fill(self.gradient.front_mut(), [0.0; 4])?;
        ctx.fill(self.velocity.front_mut(), [0.0; 4])
    }

    /// Current gradient and the render target for the accumulated one.
    /// Call [`WeightState::commit_gradient`] after rendering.
    pub fn gradient_split(&mut self) -> (&Buffer, &mut Buffer) {
        self.gradient.split()
    }

    pub fn commit_gradient(&mut self) {
        self.gradient.swap();
    }

    /// Applies one momentum step and clears the gradient.
    pub fn apply(&mut self, ctx: &ComputeContext, step: UpdateStep) -> Result<(), DeviceError> {
        let uniforms = Uniforms::new()
            .scalar("learning_rate", step.learning_rate)
            .scalar("l2_decay", step.l2_decay)
            .scalar("momentum", step.momentum)
            .scalar("inv_batch", 1.0 / step.batch.max(1) as f32);
        {
            let (velocity, next) = self.velocity.split();
            ctx.device.run(
                &ctx.kernels.momentum_velocity,
                &[velocity, self.gradient.front(), self.weights.front()],
                next,
                &uniforms,
            )?;
        }
        self.velocity.swap();
        {
            let (weights, next) = self.weights.split();
            ctx.device.run(
                &ctx.kernels.add,
                &[weights, self.velocity.front()],
                next,
                &Uniforms::new(),
            )?;
        }
        self.weights.swap();
        ctx.fill(self.gradient.front_mut(), [0.0; 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_sgd_step() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut state = WeightState::new(&ctx, BufferSpec::new(1)).unwrap();
        state.load(&ctx, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        {
            let (_, target) = state.gradient_split();
            target.upload(&[2.0, 2.0, 2.0, 2.0]).unwrap();
        }
        state.commit_gradient();
        let step = UpdateStep {
            learning_rate: 0.5,
            l2_decay: 0.0,
            momentum: 0.0,
            batch: 2,
        };
        state.apply(&ctx, step).unwrap();
        assert_eq!(state.weights().to_vec(), vec![0.5, 1.5, 2.5, 3.5]);
        assert!(state.gradient().to_vec().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_momentum_and_decay() {
        let ctx = ComputeContext::new("test").unwrap();
        let mut state = WeightState::new(&ctx, BufferSpec::new(1)).unwrap();
        state.load(&ctx, &[1.0; 4]).unwrap();
        let step = UpdateStep {
            learning_rate: 0.1,
            l2_decay: 0.5,
            momentum: 0.9,
            batch: 1,
        };
        // v1 = -0.1 * 0.5 = -0.05, w1 = 0.95
        state.apply(&ctx, step).unwrap();
        assert!((state.weights().get(0) - 0.95).abs() < 1e-6);
        // v2 = 0.9 * -0.05 - 0.1 * 0.475 = -0.0925, w2 = 0.8575
        state.apply(&ctx, step).unwrap();
        assert!((state.weights().get(0) - 0.8575).abs() < 1e-6);

        state.apply(&ctx, step.without_decay()).unwrap();
        // v3 = 0.9 * -0.0925 = -0.08325
        assert!((state.weights().get(0) - 0.77425).abs() < 1e-5);
    }
}
