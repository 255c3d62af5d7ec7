//! Neuron layers: connectivity, bias and activation.

use rand::rngs::StdRng;

use super::Activation;
use crate::connectivity::{Connectivity, ConnectivitySpec};
use crate::cost::Cost;
use crate::error::{DeviceError, TexelResult};
use crate::optimizer::{UpdateStep, WeightState};
use crate::substrate::{expect_side, Buffer, BufferSpec, ComputeContext, Kernel, Precision, Uniforms};

#[derive(Debug)]
pub struct NeuronLayer {
    side: usize,
    neurons: usize,
    activation: Activation,
    precision: Precision,
    connectivity: Connectivity,
    bias: WeightState,
    pre_activation: Buffer,
    output: Buffer,
    delta: Buffer,
    upstream: Buffer,
    activate: Kernel,
    derivative: Kernel,
}

impl NeuronLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &ComputeContext,
        from: usize,
        side: usize,
        neurons: usize,
        activation: Activation,
        connectivity: ConnectivitySpec,
        precision: Precision,
        rng: &mut StdRng,
    ) -> TexelResult<Self> {
        let connectivity = Connectivity::new(ctx, connectivity, from, side, precision, rng)?;
        let spec = BufferSpec::new(side).with_precision(precision);
        Ok(Self {
            side,
            neurons,
            activation,
            precision,
            connectivity,
            bias: WeightState::new(ctx, spec)?,
            pre_activation: ctx.device.allocate(spec)?,
            output: ctx.device.allocate(spec)?,
            delta: ctx.device.allocate(BufferSpec::new(side))?,
            upstream: ctx.device.allocate(BufferSpec::new(from))?,
            activate: ctx.device.compile(activation.forward_kernel())?,
            derivative: ctx.device.compile(activation.derivative_kernel())?,
        })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn neurons(&self) -> usize {
        self.neurons
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn bias(&self) -> &Buffer {
        self.bias.weights()
    }

    pub fn pre_activation(&self) -> &Buffer {
        &self.pre_activation
    }

    pub fn output(&self) -> &Buffer {
        &self.output
    }

    pub fn delta(&self) -> &Buffer {
        &self.delta
    }

    /// `Wᵀ·delta` from the last backward pass, read by the predecessor.
    pub fn upstream(&self) -> &Buffer {
        &self.upstream
    }

    fn active(&self) -> Uniforms {
        Uniforms::new().scalar("active", self.neurons as f32)
    }

    pub fn forward(&mut self, ctx: &ComputeContext, input: &Buffer) -> Result<(), DeviceError> {
        self.connectivity.feedforward(
            ctx,
            input,
            self.bias.weights(),
            &mut self.pre_activation,
        )?;
        let uniforms = self.active();
        ctx.device
            .run(&self.activate, &[&self.pre_activation], &mut self.output, &uniforms)
    }

    /// Output-layer delta from the cost kernel.
    pub fn output_delta(
        &mut self,
        ctx: &ComputeContext,
        cost: &Kernel,
        expected: &Buffer,
        delta_mask: &Buffer,
        clamp_mask: &Buffer,
    ) -> Result<(), DeviceError> {
        expect_side(expected, self.side, "expected output")?;
        let uniforms = self.active();
        ctx.device.run(
            cost,
            &[
                &self.output,
                expected,
                delta_mask,
                clamp_mask,
                &self.pre_activation,
            ],
            &mut self.delta,
            &uniforms,
        )
    }

    /// Hidden-layer delta: `upstream ⊙ f'(pre)`.
    pub fn hidden_delta(&mut self, ctx: &ComputeContext, upstream: &Buffer) -> Result<(), DeviceError> {
        expect_side(upstream, self.side, "downstream delta")?;
        let uniforms = self.active();
        ctx.device.run(
            &self.derivative,
            &[upstream, &self.pre_activation, &self.output],
            &mut self.delta,
            &uniforms,
        )
    }

    /// Accumulates weight and bias gradients for the current delta and, when
    /// requested, renders the upstream delta for the predecessor.
    pub fn backward(
        &mut self,
        ctx: &ComputeContext,
        input: &Buffer,
        propagate: bool,
    ) -> Result<(), DeviceError> {
        self.connectivity.accumulate_gradient(ctx, &self.delta, input)?;
        {
            let (previous, target) = self.bias.gradient_split();
            ctx.device
                .run(&ctx.kernels.add, &[previous, &self.delta], target, &Uniforms::new())?;
        }
        self.bias.commit_gradient();
        if propagate {
            self.connectivity
                .backpropagate(ctx, &self.delta, &mut self.upstream)?;
        }
        Ok(())
    }

    /// Momentum step on weights (with decay) and bias (without).
    pub fn update(&mut self, ctx: &ComputeContext, step: UpdateStep) -> Result<(), DeviceError> {
        self.connectivity.update(ctx, step)?;
        self.bias.apply(ctx, step.without_decay())
    }

    pub fn initialize(&mut self, ctx: &ComputeContext, rng: &mut StdRng) -> Result<(), DeviceError> {
        self.connectivity.initialize(ctx, rng)?;
        self.bias.load(ctx, &[])
    }

    pub fn load(&mut self, ctx: &ComputeContext, weights: &[f32], bias: &[f32]) -> Result<(), DeviceError> {
        let slots = self.side * self.side * 4;
        if bias.len() != slots {
            return Err(DeviceError::InvalidBuffer(format!(
                "bias expects {slots} values, got {}",
                bias.len()
            )));
        }
        self.connectivity.load_weights(ctx, weights)?;
        self.bias.load(ctx, bias)
    }

    pub fn cost_kernel(&self, ctx: &ComputeContext, cost: Cost) -> Result<Kernel, DeviceError> {
        ctx.device.compile(cost.delta_kernel(self.activation))
    }
}
