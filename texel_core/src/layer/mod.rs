//! Layers of a network and their declarative specs.

pub mod activation;
pub mod input;
pub mod neuron;

use serde::{Deserialize, Serialize};

pub use activation::Activation;
pub use input::{InputLayer, Preprocessing};
pub use neuron::NeuronLayer;

use crate::connectivity::ConnectivitySpec;
use crate::substrate::{Buffer, Precision, LANES};

/// One entry of `[network] layers`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LayerSpec {
    Input {
        /// Side of the layer grid in pixels.
        size: usize,
        /// Active neurons; defaults to every slot of the grid.
        #[serde(default)]
        neurons: Option<usize>,
        #[serde(default)]
        preprocessing: Preprocessing,
        #[serde(default)]
        precision: Precision,
    },
    Neuron {
        size: usize,
        #[serde(default)]
        neurons: Option<usize>,
        #[serde(default)]
        activation: Activation,
        connectivity: ConnectivitySpec,
        #[serde(default)]
        precision: Precision,
    },
}

impl LayerSpec {
    pub fn size(&self) -> usize {
        match self {
            LayerSpec::Input { size, .. } | LayerSpec::Neuron { size, .. } => *size,
        }
    }

    /// Active neuron count.
    pub fn neurons(&self) -> usize {
        match self {
            LayerSpec::Input { size, neurons, .. } | LayerSpec::Neuron { size, neurons, .. } => {
                neurons.unwrap_or(capacity(*size))
            }
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, LayerSpec::Input { .. })
    }
}

/// Number of neuron slots in a layer of `side`.
pub fn capacity(side: usize) -> usize {
    side * side * LANES
}

/// A constructed layer.
#[derive(Debug)]
pub enum Layer {
    Input(InputLayer),
    Neuron(NeuronLayer),
}

impl Layer {
    pub fn side(&self) -> usize {
        match self {
            Layer::Input(layer) => layer.side(),
            Layer::Neuron(layer) => layer.side(),
        }
    }

    pub fn neurons(&self) -> usize {
        match self {
            Layer::Input(layer) => layer.neurons(),
            Layer::Neuron(layer) => layer.neurons(),
        }
    }

    pub fn output(&self) -> &Buffer {
        match self {
            Layer::Input(layer) => layer.output(),
            Layer::Neuron(layer) => layer.output(),
        }
    }

    pub fn as_neuron(&self) -> Option<&NeuronLayer> {
        match self {
            Layer::Neuron(layer) => Some(layer),
            Layer::Input(_) => None,
        }
    }

    pub fn as_neuron_mut(&mut self) -> Option<&mut NeuronLayer> {
        match self {
            Layer::Neuron(layer) => Some(layer),
            Layer::Input(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_spec_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            layers: Vec<LayerSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[layers]]
            type = "input"
            size = 8
            preprocessing = "grayscaleLocalNorm"

            [[layers]]
            type = "neuron"
            size = 2
            neurons = 10
            activation = "sigmoid"
            connectivity = { kind = "conv", kernels = 2, sparsity = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(parsed.layers.len(), 2);
        assert_eq!(parsed.layers[0].neurons(), 256);
        assert!(parsed.layers[0].is_input());
        assert_eq!(
            parsed.layers[1],
            LayerSpec::Neuron {
                size: 2,
                neurons: Some(10),
                activation: Activation::Sigmoid,
                connectivity: ConnectivitySpec::Conv {
                    kernels: 2,
                    sparsity: 5
                },
                precision: Precision::Full,
            }
        );
    }
}
