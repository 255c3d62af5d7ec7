//! Feed-forward chain of layers.
//!
//! The chain is built once from a declarative layer list and never changes
//! shape afterwards: only weights are re-initialised or loaded. Layers are
//! linked by index; a layer reads its predecessor's output and its
//! successor's upstream delta through shared borrows.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{check_version, CheckpointError, Checkpointable};
use crate::cost::{masked_error, Cost, ErrorScratch};
use crate::error::{ConfigurationError, DeviceError, NumericError, TexelError, TexelResult};
use crate::export::{ExportedLayer, ExportedModel, TrainingSummary, FORMAT_VERSION};
use crate::layer::{capacity, InputLayer, Layer, LayerSpec, NeuronLayer};
use crate::optimizer::UpdateStep;
use crate::substrate::{expect_side, Buffer, ComputeContext, Kernel};

const BACKUP_VERSION: u32 = 1;

/// Per-layer hyperparameters of one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerRates {
    pub learning_rate: f32,
    pub l2_decay: f32,
}

pub struct Network {
    ctx: Arc<ComputeContext>,
    specs: Vec<LayerSpec>,
    layers: Vec<Layer>,
    cost: Cost,
    cost_kernel: Kernel,
    error_scratch: ErrorScratch,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("specs", &self.specs)
            .field("cost", &self.cost)
            .finish()
    }
}

impl Network {
    /// Checks a layer list and cost without allocating anything.
    pub fn validate(specs: &[LayerSpec], cost: Cost) -> Result<(), ConfigurationError> {
        let first = specs.first().ok_or(ConfigurationError::InvalidLayer {
            index: 0,
            reason: "network has no layers".into(),
        })?;
        if !first.is_input() {
            return Err(ConfigurationError::InvalidLayer {
                index: 0,
                reason: "the first layer must be an input layer".into(),
            });
        }
        if specs.len() < 2 {
            return Err(ConfigurationError::InvalidLayer {
                index: 0,
                reason: "at least one neuron layer is required".into(),
            });
        }

        for (index, spec) in specs.iter().enumerate() {
            if spec.size() == 0 {
                return Err(ConfigurationError::InvalidLayer {
                    index,
                    reason: "size must be positive".into(),
                });
            }
            let neurons = spec.neurons();
            if neurons == 0 || neurons > capacity(spec.size()) {
                return Err(ConfigurationError::InvalidLayer {
                    index,
                    reason: format!(
                        "{neurons} neurons do not fit a {0}x{0} layer (1..={1})",
                        spec.size(),
                        capacity(spec.size())
                    ),
                });
            }
            match spec {
                LayerSpec::Input { .. } if index > 0 => {
                    return Err(ConfigurationError::InvalidLayer {
                        index,
                        reason: "only the first layer may be an input layer".into(),
                    });
                }
                LayerSpec::Neuron { connectivity, .. } => {
                    connectivity.validate(specs[index - 1].size(), spec.size())?;
                }
                LayerSpec::Input { .. } => {}
            }
        }

        if let Some(LayerSpec::Neuron { activation, .. }) = specs.last() {
            cost.check(*activation)?;
        }
        Ok(())
    }

    /// Validates, allocates and initialises a network.
    pub fn new(
        ctx: Arc<ComputeContext>,
        specs: &[LayerSpec],
        cost: Cost,
        seed: u64,
    ) -> TexelResult<Self> {
        Self::validate(specs, cost)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let layer = match *spec {
                LayerSpec::Input {
                    size,
                    preprocessing,
                    precision,
                    ..
                } => Layer::Input(InputLayer::new(
                    &ctx,
                    size,
                    spec.neurons(),
                    preprocessing,
                    precision,
                )?),
                LayerSpec::Neuron {
                    size,
                    activation,
                    connectivity,
                    precision,
                    ..
                } => Layer::Neuron(NeuronLayer::new(
                    &ctx,
                    specs[index - 1].size(),
                    size,
                    spec.neurons(),
                    activation,
                    connectivity,
                    precision,
                    &mut rng,
                )?),
            };
            layers.push(layer);
        }

        let output = layers
            .last()
            .and_then(Layer::as_neuron)
            .ok_or_else(|| DeviceError::InvalidBuffer("network has no output layer".into()))?;
        let cost_kernel = output.cost_kernel(&ctx, cost)?;
        let error_scratch = ErrorScratch::new(&ctx, output.side())?;
        tracing::info!(
            layers = layers.len(),
            parameters = Self::count_parameters(&layers),
            cost = cost.name(),
            "network constructed"
        );
        Ok(Self {
            ctx,
            specs: specs.to_vec(),
            layers,
            cost,
            cost_kernel,
            error_scratch,
        })
    }

    fn count_parameters(layers: &[Layer]) -> usize {
        layers
            .iter()
            .filter_map(Layer::as_neuron)
            .map(|layer| layer.connectivity().geometry().weight_count() + layer.bias().len())
            .sum()
    }

    pub fn context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn parameter_count(&self) -> usize {
        Self::count_parameters(&self.layers)
    }

    pub fn input_side(&self) -> usize {
        self.layers[0].side()
    }

    pub fn output_side(&self) -> usize {
        self.output().side()
    }

    pub fn neuron_layer_count(&self) -> usize {
        self.layers.len() - 1
    }

    /// Activation of the output layer after the last forward pass.
    pub fn output(&self) -> &Buffer {
        // validated: the chain has at least two layers
        self.layers[self.layers.len() - 1].output()
    }

    /// Runs the input through the chain.
    pub fn forward(&mut self, input: &Buffer, input_blur: f32) -> Result<(), DeviceError> {
        let ctx = self.ctx.as_ref();
        if let Layer::Input(layer) = &mut self.layers[0] {
            layer.forward(ctx, input, input_blur)?;
        }
        for index in 1..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(index);
            let source = before[index - 1].output();
            if let Some(layer) = rest[0].as_neuron_mut() {
                layer.forward(ctx, source)?;
            }
        }
        Ok(())
    }

    /// Computes deltas from the output back to the first neuron layer and
    /// accumulates weight gradients. The input layer is skipped.
    pub fn backward(
        &mut self,
        expected: &Buffer,
        delta_mask: &Buffer,
        clamp_mask: &Buffer,
    ) -> Result<(), DeviceError> {
        let ctx = self.ctx.as_ref();
        let last = self.layers.len() - 1;
        expect_side(delta_mask, self.layers[last].side(), "delta mask")?;
        expect_side(clamp_mask, self.layers[last].side(), "clamp mask")?;
        for index in (1..=last).rev() {
            let (left, right) = self.layers.split_at_mut(index + 1);
            let (before, current) = left.split_at_mut(index);
            let Some(layer) = current[0].as_neuron_mut() else {
                continue;
            };
            if index == last {
                layer.output_delta(ctx, &self.cost_kernel, expected, delta_mask, clamp_mask)?;
            } else if let Some(next) = right.first().and_then(Layer::as_neuron) {
                layer.hidden_delta(ctx, next.upstream())?;
            }
            layer.backward(ctx, before[index - 1].output(), index > 1)?;
        }
        Ok(())
    }

    /// Applies one momentum step to every neuron layer. `rates` holds one
    /// entry per neuron layer.
    pub fn update(&mut self, rates: &[LayerRates], momentum: f32, batch: usize) -> Result<(), DeviceError> {
        if rates.len() != self.neuron_layer_count() {
            return Err(DeviceError::InvalidBuffer(format!(
                "{} learning rates for {} neuron layers",
                rates.len(),
                self.neuron_layer_count()
            )));
        }
        let ctx = self.ctx.as_ref();
        for (layer, rate) in self
            .layers
            .iter_mut()
            .filter_map(Layer::as_neuron_mut)
            .zip(rates)
        {
            layer.update(
                ctx,
                UpdateStep {
                    learning_rate: rate.learning_rate,
                    l2_decay: rate.l2_decay,
                    momentum,
                    batch,
                },
            )?;
        }
        Ok(())
    }

    /// Masked mean squared error of the current output.
    pub fn error(&mut self, expected: &Buffer, mask: &Buffer) -> Result<f32, DeviceError> {
        let last = self.layers.len() - 1;
        let output = self.layers[last].output();
        masked_error(&self.ctx, &mut self.error_scratch, output, expected, mask)
    }

    /// Fails on the first NaN or infinity in any weight or bias buffer.
    pub fn validate_finite(&self) -> Result<(), NumericError> {
        for (index, layer) in self.layers.iter().enumerate() {
            let Some(layer) = layer.as_neuron() else {
                continue;
            };
            if let Some(slot) = layer.connectivity().weights().first_non_finite() {
                return Err(NumericError {
                    buffer: "weights".into(),
                    layer: index,
                    index: slot,
                });
            }
            if let Some(slot) = layer.bias().first_non_finite() {
                return Err(NumericError {
                    buffer: "bias".into(),
                    layer: index,
                    index: slot,
                });
            }
        }
        Ok(())
    }

    /// Draws fresh weights from `seed` and clears optimizer state.
    pub fn initialize(&mut self, seed: u64) -> Result<(), DeviceError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let ctx = self.ctx.as_ref();
        for layer in self.layers.iter_mut().filter_map(Layer::as_neuron_mut) {
            layer.initialize(ctx, &mut rng)?;
        }
        Ok(())
    }

    /// Reads every buffer back into an exportable artifact.
    pub fn export(
        &self,
        metadata: serde_json::Value,
        training: Option<TrainingSummary>,
    ) -> Result<ExportedModel, DeviceError> {
        let device = &self.ctx.device;
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let exported = match layer {
                Layer::Input(input) => ExportedLayer::Input {
                    size: input.side(),
                    neurons: input.neurons(),
                    preprocessing: input.preprocessing(),
                    precision: input.precision(),
                },
                Layer::Neuron(neuron) => ExportedLayer::Neuron {
                    size: neuron.side(),
                    neurons: neuron.neurons(),
                    activation: neuron.activation(),
                    connectivity: neuron.connectivity().spec(),
                    precision: neuron.precision(),
                    weights: device.read(neuron.connectivity().weights())?,
                    bias: device.read(neuron.bias())?,
                },
            };
            layers.push(exported);
        }
        Ok(ExportedModel {
            format_version: FORMAT_VERSION,
            layers,
            metadata,
            training,
        })
    }

    /// Builds a network with the topology and weights of an artifact.
    pub fn from_export(ctx: Arc<ComputeContext>, model: &ExportedModel, cost: Cost) -> TexelResult<Self> {
        let mut network = Self::new(ctx, &model.layer_specs(), cost, 0)?;
        network.load_export(model)?;
        Ok(network)
    }

    /// Loads the weights of an artifact with identical topology.
    pub fn load_export(&mut self, model: &ExportedModel) -> TexelResult<()> {
        if model.layer_specs() != self.specs_resolved() {
            return Err(TexelError::InvalidExport(
                "artifact topology does not match the network".into(),
            ));
        }
        let ctx = self.ctx.as_ref();
        for (layer, exported) in self.layers.iter_mut().zip(&model.layers) {
            if let (Layer::Neuron(layer), ExportedLayer::Neuron { weights, bias, .. }) =
                (layer, exported)
            {
                layer.load(ctx, weights, bias)?;
            }
        }
        Ok(())
    }

    /// Specs with every optional field made explicit.
    fn specs_resolved(&self) -> Vec<LayerSpec> {
        self.specs
            .iter()
            .map(|spec| match *spec {
                LayerSpec::Input {
                    size,
                    preprocessing,
                    precision,
                    ..
                } => LayerSpec::Input {
                    size,
                    neurons: Some(spec.neurons()),
                    preprocessing,
                    precision,
                },
                LayerSpec::Neuron {
                    size,
                    activation,
                    connectivity,
                    precision,
                    ..
                } => LayerSpec::Neuron {
                    size,
                    neurons: Some(spec.neurons()),
                    activation,
                    connectivity,
                    precision,
                },
            })
            .collect()
    }

    /// Host copy of every trainable buffer.
    pub fn backup(&self) -> Result<NetworkBackup, DeviceError> {
        let device = &self.ctx.device;
        let mut layers = Vec::new();
        for layer in self.layers.iter().filter_map(Layer::as_neuron) {
            layers.push(LayerBackup {
                weights: device.read(layer.connectivity().weights())?,
                bias: device.read(layer.bias())?,
            });
        }
        Ok(NetworkBackup {
            version: BACKUP_VERSION,
            specs: self.specs_resolved(),
            layers,
        })
    }

    /// Loads a backup taken from a network of identical topology.
    pub fn restore(&mut self, backup: &NetworkBackup) -> TexelResult<()> {
        check_version(BACKUP_VERSION, backup.version)?;
        if backup.specs != self.specs_resolved() {
            return Err(CheckpointError::InvalidFormat(
                "layer topology differs from the running network".into(),
            )
            .into());
        }
        let ctx = self.ctx.as_ref();
        for (layer, saved) in self
            .layers
            .iter_mut()
            .filter_map(Layer::as_neuron_mut)
            .zip(&backup.layers)
        {
            layer.load(ctx, &saved.weights, &saved.bias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerBackup {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Binary backup of a network's weights, used to resume or warm-start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBackup {
    version: u32,
    #[serde(with = "topology_json")]
    specs: Vec<LayerSpec>,
    layers: Vec<LayerBackup>,
}

/// Layer specs are internally tagged, which bincode cannot decode, so the
/// topology travels as a JSON string inside the binary payload.
mod topology_json {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::layer::LayerSpec;

    pub fn serialize<S: Serializer>(specs: &[LayerSpec], serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(specs).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<LayerSpec>, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

impl NetworkBackup {
    pub fn layers(&self) -> &[LayerBackup] {
        &self.layers
    }
}

impl Checkpointable for NetworkBackup {
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        Self::write_snapshot(self, path)
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let backup: Self = Self::read_snapshot(path)?;
        check_version(BACKUP_VERSION, backup.version)?;
        if backup.layers.len() + 1 != backup.specs.len() {
            return Err(CheckpointError::InvalidFormat(format!(
                "{} weight sets for {} layers",
                backup.layers.len(),
                backup.specs.len()
            )));
        }
        Ok(backup)
    }
}
