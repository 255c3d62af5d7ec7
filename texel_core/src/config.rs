//! Training scripts.
//!
//! A script is a TOML document parsed into typed sections with explicit
//! per-field defaults. [`TrainingScript::validate`] checks it against a
//! provider registry before anything is allocated, so malformed scripts fail
//! at load time.
//!
//! ```toml
//! [network]
//! layers = [
//!     { type = "input", size = 1, neurons = 4 },
//!     { type = "neuron", size = 1, neurons = 2, connectivity = { kind = "full" } },
//! ]
//!
//! [problem]
//! provider = "xorLike"
//!
//! [training]
//! learning_rates = [0.3]
//! minibatches = 100
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::augment::AugmentationSpec;
use crate::cost::Cost;
use crate::error::{ConfigurationError, TexelResult};
use crate::layer::LayerSpec;
use crate::network::{LayerRates, Network};
use crate::problem::{BackgroundKind, PoolConfig, Provider, ProviderRegistry};
use crate::trainer::{BlurSchedule, EvaluationPolicy, LearningRateDecay};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemSection {
    pub provider: String,
    /// Provider-specific options, checked by the provider's factory.
    #[serde(default)]
    pub options: toml::Table,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    /// Background drawn behind every generated sample.
    #[serde(default)]
    pub background: Option<BackgroundKind>,
    #[serde(default = "ProblemSection::default_test_samples")]
    pub test_samples: usize,
    #[serde(default = "ProblemSection::default_test_seed")]
    pub test_seed: u64,
}

impl ProblemSection {
    fn default_test_samples() -> usize {
        100
    }

    fn default_test_seed() -> u64 {
        0x7e57
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    #[serde(default)]
    pub cost: Cost,
    /// One rate per neuron layer.
    pub learning_rates: Vec<f32>,
    /// One L2 coefficient per neuron layer; empty means no decay.
    #[serde(default)]
    pub l2_decay: Vec<f32>,
    #[serde(default = "TrainingSection::default_momentum")]
    pub momentum: f32,
    #[serde(default = "TrainingSection::default_minibatch_size")]
    pub minibatch_size: usize,
    /// Minibatch budget of the run.
    pub minibatches: usize,
    #[serde(default = "TrainingSection::default_test_every")]
    pub test_every: usize,
    #[serde(default = "TrainingSection::default_validate_every")]
    pub validate_every: usize,
    #[serde(default)]
    pub evaluation: EvaluationPolicy,
    #[serde(default = "TrainingSection::default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub lr_decay: Option<LearningRateDecay>,
    /// Checkpoint to warm-start from.
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
}

impl TrainingSection {
    fn default_momentum() -> f32 {
        0.9
    }

    fn default_minibatch_size() -> usize {
        16
    }

    fn default_test_every() -> usize {
        100
    }

    fn default_validate_every() -> usize {
        10
    }

    fn default_seed() -> u64 {
        1
    }

    /// Per-layer rates after decay at `minibatch`.
    pub fn layer_rates(&self, minibatch: usize) -> Vec<LayerRates> {
        let multiplier = self
            .lr_decay
            .map_or(1.0, |decay| decay.multiplier(minibatch));
        self.learning_rates
            .iter()
            .enumerate()
            .map(|(index, rate)| LayerRates {
                learning_rate: rate * multiplier,
                l2_decay: self.l2_decay.get(index).copied().unwrap_or(0.0),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSection {
    /// Gaussian blur sigma applied by the input layer.
    #[serde(default)]
    pub input_blur: Option<BlurSchedule>,
    /// Gaussian blur sigma applied to expected outputs.
    #[serde(default)]
    pub output_blur: Option<BlurSchedule>,
}

impl ScheduleSection {
    pub fn input_blur_at(&self, minibatch: usize) -> f32 {
        self.input_blur.map_or(0.0, |schedule| schedule.at(minibatch))
    }

    pub fn output_blur_at(&self, minibatch: usize) -> f32 {
        self.output_blur.map_or(0.0, |schedule| schedule.at(minibatch))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    /// Where the best snapshot is exported on every improvement.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
    /// Binary backup of the best weights.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    /// Directory of the JSONL evaluation log.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "OutputSection::default_progress_every")]
    pub progress_every: usize,
}

impl OutputSection {
    fn default_progress_every() -> usize {
        1
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            export_path: None,
            checkpoint_path: None,
            log_dir: None,
            progress_every: Self::default_progress_every(),
        }
    }
}

/// A complete training script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingScript {
    pub network: NetworkSection,
    pub problem: ProblemSection,
    #[serde(default)]
    pub augmentation: Vec<AugmentationSpec>,
    pub training: TrainingSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub output: OutputSection,
}

impl FromStr for TrainingScript {
    type Err = ConfigurationError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        toml::from_str(toml_str).map_err(|err| ConfigurationError::Parse(err.to_string()))
    }
}

impl TrainingScript {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> TexelResult<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(contents.parse()?)
    }

    pub fn neuron_layer_count(&self) -> usize {
        self.network
            .layers
            .iter()
            .filter(|layer| !layer.is_input())
            .count()
    }

    /// Checks the whole script and returns its provider, built from the
    /// registry. Nothing is allocated on the compute device.
    pub fn validate(&self, registry: &ProviderRegistry) -> Result<Box<dyn Provider>, ConfigurationError> {
        let provider = registry.create(&self.problem.provider, &self.problem.options)?;
        let layers = &self.network.layers;
        Network::validate(layers, self.training.cost)?;
        self.check_provider_fit(provider.as_ref())?;
        self.check_problem()?;
        self.check_training()?;
        for (index, pass) in self.augmentation.iter().enumerate() {
            pass.validate(index)?;
        }
        if let Some(schedule) = &self.schedule.input_blur {
            schedule.validate("input_blur")?;
        }
        if let Some(schedule) = &self.schedule.output_blur {
            schedule.validate("output_blur")?;
        }
        if self.output.progress_every == 0 {
            return Err(ConfigurationError::parameter(
                "output.progress_every",
                0,
                "progress_every >= 1",
            ));
        }
        Ok(provider)
    }

    fn check_provider_fit(&self, provider: &dyn Provider) -> Result<(), ConfigurationError> {
        let layers = &self.network.layers;
        let last = layers.len() - 1;
        if layers[0].size() != provider.input_side() {
            return Err(ConfigurationError::InvalidLayer {
                index: 0,
                reason: format!(
                    "provider '{}' produces {1}x{1} inputs, layer size is {2}",
                    provider.name(),
                    provider.input_side(),
                    layers[0].size()
                ),
            });
        }
        if layers[last].size() != provider.output_side() {
            return Err(ConfigurationError::InvalidLayer {
                index: last,
                reason: format!(
                    "provider '{}' expects {1}x{1} outputs, layer size is {2}",
                    provider.name(),
                    provider.output_side(),
                    layers[last].size()
                ),
            });
        }
        if layers[last].neurons() < provider.output_neurons() {
            return Err(ConfigurationError::InvalidLayer {
                index: last,
                reason: format!(
                    "provider '{}' needs {} output neurons, layer has {}",
                    provider.name(),
                    provider.output_neurons(),
                    layers[last].neurons()
                ),
            });
        }
        Ok(())
    }

    fn check_problem(&self) -> Result<(), ConfigurationError> {
        let problem = &self.problem;
        if problem.test_samples == 0 {
            return Err(ConfigurationError::parameter(
                "problem.test_samples",
                0,
                "test_samples >= 1",
            ));
        }
        if let Some(pool) = problem.pool {
            if pool.size == 0 || pool.max_uses == 0 {
                return Err(ConfigurationError::parameter(
                    "problem.pool",
                    format!("{{ size = {}, max_uses = {} }}", pool.size, pool.max_uses),
                    "size >= 1 and max_uses >= 1",
                ));
            }
        }
        Ok(())
    }

    fn check_training(&self) -> Result<(), ConfigurationError> {
        let training = &self.training;
        let expected = self.neuron_layer_count();
        if training.learning_rates.len() != expected {
            return Err(ConfigurationError::parameter(
                "training.learning_rates",
                format!("{:?}", training.learning_rates),
                format!("one rate per neuron layer ({expected})"),
            ));
        }
        if !training.l2_decay.is_empty() && training.l2_decay.len() != expected {
            return Err(ConfigurationError::parameter(
                "training.l2_decay",
                format!("{:?}", training.l2_decay),
                format!("empty or one value per neuron layer ({expected})"),
            ));
        }
        let non_negative = |values: &[f32]| values.iter().all(|v| v.is_finite() && *v >= 0.0);
        if !non_negative(&training.learning_rates) || !non_negative(&training.l2_decay) {
            return Err(ConfigurationError::parameter(
                "training.learning_rates",
                format!("{:?} / {:?}", training.learning_rates, training.l2_decay),
                "finite and >= 0",
            ));
        }
        if !(0.0..1.0).contains(&training.momentum) {
            return Err(ConfigurationError::parameter(
                "training.momentum",
                training.momentum,
                "0 <= momentum < 1",
            ));
        }
        if training.minibatch_size == 0 {
            return Err(ConfigurationError::parameter(
                "training.minibatch_size",
                0,
                "minibatch_size >= 1",
            ));
        }
        if training.minibatches == 0 {
            return Err(ConfigurationError::parameter(
                "training.minibatches",
                0,
                "minibatches >= 1",
            ));
        }
        if let Some(decay) = &training.lr_decay {
            decay.validate()?;
        }
        Ok(())
    }
}
