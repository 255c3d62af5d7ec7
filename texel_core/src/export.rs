//! The exported model artifact.
//!
//! A JSON document consumed by the inference runtime: per-layer topology and
//! flattened weights, the provider's metadata and a summary of the training
//! run that produced the snapshot.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connectivity::ConnectivitySpec;
use crate::error::{TexelError, TexelResult};
use crate::layer::{Activation, LayerSpec, Preprocessing};
use crate::substrate::Precision;
use crate::trainer::EvaluationPolicy;

/// Bumped whenever the artifact layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExportedLayer {
    #[serde(rename_all = "camelCase")]
    Input {
        size: usize,
        neurons: usize,
        preprocessing: Preprocessing,
        precision: Precision,
    },
    #[serde(rename_all = "camelCase")]
    Neuron {
        size: usize,
        neurons: usize,
        activation: Activation,
        connectivity: ConnectivitySpec,
        precision: Precision,
        /// Packed weight slots in row-major pixel order.
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
}

impl ExportedLayer {
    pub fn spec(&self) -> LayerSpec {
        match self {
            ExportedLayer::Input {
                size,
                neurons,
                preprocessing,
                precision,
            } => LayerSpec::Input {
                size: *size,
                neurons: Some(*neurons),
                preprocessing: *preprocessing,
                precision: *precision,
            },
            ExportedLayer::Neuron {
                size,
                neurons,
                activation,
                connectivity,
                precision,
                ..
            } => LayerSpec::Neuron {
                size: *size,
                neurons: Some(*neurons),
                activation: *activation,
                connectivity: *connectivity,
                precision: *precision,
            },
        }
    }
}

/// How the snapshot was selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSummary {
    pub provider: String,
    pub policy: EvaluationPolicy,
    pub minibatches: usize,
    pub samples: usize,
    pub success_rate: f32,
    pub error: f32,
    pub snapshot_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedModel {
    pub format_version: u32,
    pub layers: Vec<ExportedLayer>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub training: Option<TrainingSummary>,
}

impl ExportedModel {
    pub fn layer_specs(&self) -> Vec<LayerSpec> {
        self.layers.iter().map(ExportedLayer::spec).collect()
    }

    pub fn to_json(&self) -> TexelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> TexelResult<Self> {
        let model: Self = serde_json::from_str(json)?;
        if model.format_version != FORMAT_VERSION {
            return Err(TexelError::InvalidExport(format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                model.format_version
            )));
        }
        Ok(model)
    }

    /// Writes the artifact, creating parent directories.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> TexelResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read<P: AsRef<Path>>(path: P) -> TexelResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}
