//! # texel
//!
//! A trainable pattern-recognition engine that defines, trains and evaluates
//! small feed-forward networks entirely through raster compute passes: every
//! step of training is "draw into buffer X using kernel K over bound
//! inputs". Buffers are square grids of 4-lane pixels, so one pixel carries
//! four neurons.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use texel_core::{ProviderRegistry, Trainer, TrainingScript};
//!
//! let script = TrainingScript::load_from_file("scripts/xor_like.toml")?;
//! let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
//! trainer.load(script)?;
//! let report = trainer.run()?;
//! println!("best: {:?}", report.best);
//! # Ok::<(), texel_core::TexelError>(())
//! ```
//!
//! ## Core Modules
//!
//! - [`substrate`] - Buffers, kernels and the compute device
//! - [`kernels`] - Shared kernel catalog
//! - [`connectivity`] - The six wiring schemes between layers
//! - [`layer`] / [`network`] - Layers chained into a network
//! - [`problem`] - Sample providers, the sample pool and backgrounds
//! - [`augment`] - Stochastic augmentation passes
//! - [`trainer`] - The training state machine and evaluator
//! - [`export`] / [`checkpoint`] - Model artifacts and weight backups

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod connectivity;
pub mod cost;
pub mod error;
pub mod export;
pub mod kernels;
pub mod layer;
pub mod logging;
pub mod network;
pub mod optimizer;
pub mod problem;
pub mod substrate;
pub mod trainer;

pub use augment::{AugmentationKind, AugmentationPipeline, AugmentationSpec};
pub use checkpoint::{CheckpointError, Checkpointable};
pub use config::TrainingScript;
pub use connectivity::{Connectivity, ConnectivitySpec, Geometry};
pub use cost::Cost;
pub use error::{
    ConfigurationError, DeviceError, NumericError, SampleGenerationError, TexelError, TexelResult,
};
pub use export::{ExportedLayer, ExportedModel, TrainingSummary};
pub use layer::{Activation, LayerSpec, Preprocessing};
pub use network::{LayerRates, Network, NetworkBackup};
pub use problem::{
    BackgroundKind, PoolConfig, Problem, Provider, ProviderRegistry, Sample, SampleMetadata,
    SuccessCriterion,
};
pub use substrate::{Buffer, BufferSpec, ComputeContext, Device, Precision};
pub use trainer::{
    EvaluationPolicy, EvaluationRecord, Evaluator, Trainer, TrainerControl, TrainerState,
    TrainingReport,
};
