//! texel-trainer - run a training script to completion
//!
//! ```bash
//! # Train with the budget and outputs declared in the script
//! cargo run -p texel_trainer -- train scripts/xor_like.toml
//!
//! # Override the budget and the export location
//! cargo run -p texel_trainer -- train scripts/glyphs.toml \
//!   --minibatches 200 --export out/glyphs.json
//!
//! # Check a script without training
//! cargo run -p texel_trainer -- check scripts/glyphs.toml
//!
//! # Summarise an exported model
//! cargo run -p texel_trainer -- inspect out/glyphs.json
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use texel_core::{
    ExportedLayer, ExportedModel, ProviderRegistry, Trainer, TrainingScript,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "texel-trainer", version, about = "Train raster-compute recognition networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a script until its minibatch budget is spent
    Train {
        /// TOML training script
        script: PathBuf,

        /// Replace the minibatch budget of the script
        #[arg(long)]
        minibatches: Option<usize>,

        /// Where to export the best snapshot
        #[arg(long)]
        export: Option<PathBuf>,

        /// Binary backup of the best weights
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Directory of the JSONL evaluation log
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Replace the seed of the script
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Validate a script without allocating anything
    Check {
        script: PathBuf,
    },
    /// Print the topology and training summary of an exported model
    Inspect {
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Train {
            script,
            minibatches,
            export,
            checkpoint,
            log_dir,
            seed,
        } => {
            let mut loaded = load_script(&script)?;
            if let Some(minibatches) = minibatches {
                loaded.training.minibatches = minibatches;
            }
            if let Some(seed) = seed {
                loaded.training.seed = seed;
            }
            if export.is_some() {
                loaded.output.export_path = export;
            }
            if checkpoint.is_some() {
                loaded.output.checkpoint_path = checkpoint;
            }
            if log_dir.is_some() {
                loaded.output.log_dir = log_dir;
            }
            train(loaded)
        }
        Command::Check { script } => {
            let loaded = load_script(&script)?;
            let provider = loaded
                .validate(&ProviderRegistry::with_builtins())
                .with_context(|| format!("invalid script {}", script.display()))?;
            tracing::info!(
                provider = provider.name(),
                layers = loaded.network.layers.len(),
                minibatches = loaded.training.minibatches,
                "script is valid"
            );
            Ok(())
        }
        Command::Inspect { model } => inspect(&model),
    }
}

fn load_script(path: &Path) -> Result<TrainingScript> {
    TrainingScript::load_from_file(path)
        .with_context(|| format!("failed to load training script {}", path.display()))
}

fn train(script: TrainingScript) -> Result<()> {
    let export_path = script.output.export_path.clone();
    let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
    let mut last_logged = -10.0f32;
    trainer.set_progress_callback(move |percent| {
        if percent - last_logged >= 10.0 || percent >= 100.0 {
            last_logged = percent;
            tracing::info!(progress = percent, "training progress");
        }
    });

    trainer.load(script).context("failed to load training script")?;
    let report = trainer.run().context("training failed")?;

    let Some(best) = report.best else {
        bail!(
            "no evaluation ran in {} minibatches; lower training.test_every",
            report.minibatches
        );
    };
    tracing::info!(
        minibatches = report.minibatches,
        samples = report.samples,
        best_minibatch = best.minibatch,
        success_rate = best.success_rate,
        error = best.error,
        "run finished"
    );
    if let Some(path) = export_path {
        tracing::info!(path = %path.display(), "best snapshot exported");
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let model = ExportedModel::read(path)
        .with_context(|| format!("failed to read exported model {}", path.display()))?;
    println!("format version {}", model.format_version);
    for (index, layer) in model.layers.iter().enumerate() {
        match layer {
            ExportedLayer::Input {
                size,
                neurons,
                preprocessing,
                ..
            } => println!("  [{index}] input {size}x{size}, {neurons} neurons, {preprocessing:?}"),
            ExportedLayer::Neuron {
                size,
                neurons,
                activation,
                connectivity,
                weights,
                ..
            } => println!(
                "  [{index}] {} {size}x{size}, {neurons} neurons, {activation:?}, {} weights",
                connectivity.name(),
                weights.len()
            ),
        }
    }
    if let Some(training) = &model.training {
        println!(
            "trained on {} with {}: snapshot at minibatch {} ({} samples), success {:.3}, error {:.5}",
            training.provider,
            training.policy.name(),
            training.snapshot_index,
            training.samples,
            training.success_rate,
            training.error
        );
    }
    println!("metadata {}", serde_json::to_string_pretty(&model.metadata)?);
    Ok(())
}
