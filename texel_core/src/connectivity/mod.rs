//! Neuron-to-neuron wiring between consecutive layers.
//!
//! A connectivity owns the weight buffer of its layer together with the three
//! kernels that use it:
//!
//! * **feedforward** renders the pre-activation of the destination layer from
//!   the source activation and the bias,
//! * **backpropagate** renders the upstream delta as the exact transpose of
//!   the forward mapping,
//! * **accumulate gradient** adds `delta ⊗ input` into a ping-ponged gradient
//!   buffer for the current minibatch.
//!
//! Every weight pixel packs the four source lanes of one (destination neuron,
//! source pixel or window tap) pair, so each forward term is a 4-lane dot
//! product. Geometry is validated by [`ConnectivitySpec::validate`] before any
//! buffer is allocated.

pub mod addressing;
mod conv;
mod direct;
mod full;
mod square;

use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, DeviceError, TexelResult};
use crate::optimizer::{UpdateStep, WeightState};
use crate::substrate::{expect_side, Buffer, BufferSpec, ComputeContext, Kernel, KernelSource, Precision, Uniforms};

/// Declarative wiring of a neuron layer to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectivitySpec {
    /// Every source neuron to every destination neuron; power-of-two sides.
    Full,
    /// Full wiring for arbitrary sides through an explicit address table.
    #[serde(rename = "fullNPoT")]
    FullNPoT,
    /// Each destination reads a `sparsity × sparsity` window centred at its
    /// position scaled by `from / to`.
    Square { sparsity: usize },
    /// [`ConnectivitySpec::Square`] restricted to odd windows and an integral
    /// stride, with arithmetic addressing.
    SquareFast { sparsity: usize },
    /// `kernels × kernels` shared-weight kernels tiled over the output.
    Conv { kernels: usize, sparsity: usize },
    /// One weight per neuron; requires equal sides.
    Direct,
}

impl ConnectivitySpec {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectivitySpec::Full => "full",
            ConnectivitySpec::FullNPoT => "fullNPoT",
            ConnectivitySpec::Square { .. } => "square",
            ConnectivitySpec::SquareFast { .. } => "squareFast",
            ConnectivitySpec::Conv { .. } => "conv",
            ConnectivitySpec::Direct => "direct",
        }
    }

    /// Checks the wiring between a source of side `from` and a destination
    /// of side `to`. Pure: allocates nothing.
    pub fn validate(&self, from: usize, to: usize) -> Result<Geometry, ConfigurationError> {
        let fail = |reason: String| ConfigurationError::InvalidGeometry {
            connectivity: self.name(),
            from,
            to,
            reason,
        };
        if from == 0 || to == 0 {
            return Err(fail("layer sides must be positive".into()));
        }
        let geometry = match *self {
            ConnectivitySpec::Full => {
                if !from.is_power_of_two() || !to.is_power_of_two() {
                    return Err(fail(
                        "full connectivity requires power-of-two sides (use fullNPoT)".into(),
                    ));
                }
                full::geometry(from, to)
            }
            ConnectivitySpec::FullNPoT => full::geometry(from, to),
            ConnectivitySpec::Square { sparsity } => {
                if sparsity == 0 {
                    return Err(fail("sparsity must be at least 1".into()));
                }
                square::geometry(from, to, sparsity)
            }
            ConnectivitySpec::SquareFast { sparsity } => {
                if sparsity == 0 || sparsity % 2 == 0 {
                    return Err(fail(format!("sparsity {sparsity} must be odd")));
                }
                if from < to || from % to != 0 {
                    return Err(fail(format!("stride {from}/{to} is not an integer >= 1")));
                }
                let stride = from / to;
                if stride * (sparsity - 1) >= to {
                    return Err(fail(format!(
                        "stride {stride} x (sparsity {sparsity} - 1) must be below {to}"
                    )));
                }
                square::geometry(from, to, sparsity)
            }
            ConnectivitySpec::Conv { kernels, sparsity } => {
                if kernels == 0 || sparsity == 0 {
                    return Err(fail("kernels and sparsity must be at least 1".into()));
                }
                if to % kernels != 0 {
                    return Err(fail(format!(
                        "destination side {to} cannot be tiled by {kernels} kernels per axis"
                    )));
                }
                let tile = to / kernels;
                if from % tile != 0 {
                    return Err(fail(format!(
                        "stride {kernels}*{from}/{to} is not integral"
                    )));
                }
                conv::geometry(from, to, kernels, sparsity)
            }
            ConnectivitySpec::Direct => {
                if from != to {
                    return Err(fail("direct connectivity requires equal sides".into()));
                }
                direct::geometry(from)
            }
        };
        Ok(geometry)
    }
}

/// Derived sizes of a validated connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub from: usize,
    pub to: usize,
    pub weight_side: usize,
    /// Source neurons feeding one destination neuron.
    pub fan_in: usize,
    /// Destination neurons fed by one source neuron, on average.
    pub fan_out: usize,
}

impl Geometry {
    pub(crate) fn new(from: usize, to: usize, weight_side: usize, fan_in: usize) -> Self {
        let ratio = (to * to) as f64 / (from * from) as f64;
        let fan_out = ((fan_in as f64 * ratio).round() as usize).max(1);
        Self {
            from,
            to,
            weight_side,
            fan_in,
            fan_out,
        }
    }

    /// Number of scalar weights.
    pub fn weight_count(&self) -> usize {
        self.weight_side * self.weight_side * 4
    }
}

/// Initial weight values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WeightInit {
    Xavier,
    Constant(f32),
}

/// Everything a variant contributes: kernels, tables and which tables each
/// pass binds after its fixed inputs.
pub(crate) struct Wiring {
    pub forward: KernelSource,
    pub backward: KernelSource,
    pub gradient: KernelSource,
    pub tables: Vec<Buffer>,
    pub forward_tables: Vec<usize>,
    pub backward_tables: Vec<usize>,
    pub gradient_tables: Vec<usize>,
    pub init: WeightInit,
}

impl Wiring {
    pub(crate) fn untabled(
        forward: KernelSource,
        backward: KernelSource,
        gradient: KernelSource,
        init: WeightInit,
    ) -> Self {
        Self {
            forward,
            backward,
            gradient,
            tables: Vec::new(),
            forward_tables: Vec::new(),
            backward_tables: Vec::new(),
            gradient_tables: Vec::new(),
            init,
        }
    }
}

/// Wiring and weights of one neuron layer.
#[derive(Debug)]
pub struct Connectivity {
    spec: ConnectivitySpec,
    geometry: Geometry,
    forward: Kernel,
    backward: Kernel,
    gradient: Kernel,
    tables: Vec<Buffer>,
    forward_tables: Vec<usize>,
    backward_tables: Vec<usize>,
    gradient_tables: Vec<usize>,
    init: WeightInit,
    weights: WeightState,
}

impl Connectivity {
    /// Validates, compiles and allocates a connectivity and initialises its
    /// weights from `rng`.
    pub fn new(
        ctx: &ComputeContext,
        spec: ConnectivitySpec,
        from: usize,
        to: usize,
        precision: Precision,
        rng: &mut StdRng,
    ) -> TexelResult<Self> {
        let geometry = spec.validate(from, to)?;
        let wiring = match spec {
            ConnectivitySpec::Full => full::wiring(&ctx.device, geometry, false)?,
            ConnectivitySpec::FullNPoT => full::wiring(&ctx.device, geometry, true)?,
            ConnectivitySpec::Square { sparsity } => {
                square::wiring(&ctx.device, geometry, sparsity, false)?
            }
            ConnectivitySpec::SquareFast { sparsity } => {
                square::wiring(&ctx.device, geometry, sparsity, true)?
            }
            ConnectivitySpec::Conv { kernels, sparsity } => conv::wiring(geometry, kernels, sparsity),
            ConnectivitySpec::Direct => direct::wiring(),
        };

        let weights = WeightState::new(
            ctx,
            BufferSpec::new(geometry.weight_side).with_precision(precision),
        )?;
        let mut connectivity = Self {
            spec,
            geometry,
            forward: ctx.device.compile(wiring.forward)?,
            backward: ctx.device.compile(wiring.backward)?,
            gradient: ctx.device.compile(wiring.gradient)?,
            tables: wiring.tables,
            forward_tables: wiring.forward_tables,
            backward_tables: wiring.backward_tables,
            gradient_tables: wiring.gradient_tables,
            init: wiring.init,
            weights,
        };
        connectivity.initialize(ctx, rng)?;
        tracing::debug!(
            kind = spec.name(),
            from,
            to,
            weight_side = geometry.weight_side,
            fan_in = geometry.fan_in,
            "connectivity allocated"
        );
        Ok(connectivity)
    }

    pub fn spec(&self) -> ConnectivitySpec {
        self.spec
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn weights(&self) -> &Buffer {
        self.weights.weights()
    }

    pub fn gradient(&self) -> &Buffer {
        self.weights.gradient()
    }

    /// Draws fresh weights and clears optimizer state.
    pub fn initialize(&mut self, ctx: &ComputeContext, rng: &mut StdRng) -> Result<(), DeviceError> {
        let count = self.geometry.weight_count();
        let values: Vec<f32> = match self.init {
            WeightInit::Constant(value) => vec![value; count],
            WeightInit::Xavier => {
                let limit =
                    (6.0 / (self.geometry.fan_in + self.geometry.fan_out) as f32).sqrt();
                Uniform::new_inclusive(-limit, limit)
                    .sample_iter(rng)
                    .take(count)
                    .collect()
            }
        };
        self.weights.load(ctx, &values)
    }

    /// Replaces the weights with exported values.
    pub fn load_weights(&mut self, ctx: &ComputeContext, values: &[f32]) -> Result<(), DeviceError> {
        if values.len() != self.geometry.weight_count() {
            return Err(DeviceError::InvalidBuffer(format!(
                "{} connectivity expects {} weights, got {}",
                self.spec.name(),
                self.geometry.weight_count(),
                values.len()
            )));
        }
        self.weights.load(ctx, values)
    }

    fn bind<'a>(&'a self, fixed: &[&'a Buffer], tables: &[usize]) -> Vec<&'a Buffer> {
        let mut inputs = fixed.to_vec();
        inputs.extend(tables.iter().map(|&table| &self.tables[table]));
        inputs
    }

    /// Renders `bias + W·input` into `pre_activation`.
    pub fn feedforward(
        &self,
        ctx: &ComputeContext,
        input: &Buffer,
        bias: &Buffer,
        pre_activation: &mut Buffer,
    ) -> Result<(), DeviceError> {
        expect_side(input, self.geometry.from, "feedforward input")?;
        expect_side(bias, self.geometry.to, "feedforward bias")?;
        expect_side(pre_activation, self.geometry.to, "feedforward target")?;
        let inputs = self.bind(&[input, bias, self.weights.weights()], &self.forward_tables);
        ctx.device
            .run(&self.forward, &inputs, pre_activation, &Uniforms::new())
    }

    /// Renders `Wᵀ·delta` into `upstream`.
    pub fn backpropagate(
        &self,
        ctx: &ComputeContext,
        delta: &Buffer,
        upstream: &mut Buffer,
    ) -> Result<(), DeviceError> {
        expect_side(delta, self.geometry.to, "backpropagate delta")?;
        expect_side(upstream, self.geometry.from, "backpropagate target")?;
        let inputs = self.bind(&[delta, self.weights.weights()], &self.backward_tables);
        ctx.device.run(&self.backward, &inputs, upstream, &Uniforms::new())
    }

    /// Adds the weight gradient of one sample to the minibatch accumulator.
    pub fn accumulate_gradient(
        &mut self,
        ctx: &ComputeContext,
        delta: &Buffer,
        input: &Buffer,
    ) -> Result<(), DeviceError> {
        expect_side(delta, self.geometry.to, "gradient delta")?;
        expect_side(input, self.geometry.from, "gradient input")?;
        let tables: Vec<&Buffer> = self
            .gradient_tables
            .iter()
            .map(|&table| &self.tables[table])
            .collect();
        let (previous, target) = self.weights.gradient_split();
        let mut inputs = vec![delta, input, previous];
        inputs.extend(tables);
        ctx.device
            .run(&self.gradient, &inputs, target, &Uniforms::new())?;
        self.weights.commit_gradient();
        Ok(())
    }

    pub fn update(&mut self, ctx: &ComputeContext, step: UpdateStep) -> Result<(), DeviceError> {
        self.weights.apply(ctx, step)
    }

    pub fn reset_optimizer(&mut self, ctx: &ComputeContext) -> Result<(), DeviceError> {
        self.weights.reset_optimizer(ctx)
    }
}
