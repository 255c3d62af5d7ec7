//! The training state machine.
//!
//! ```text
//! notLoaded --load--> loading --> paused <--run/pause--> running
//!                                   |                       |
//!                                   +------- stop ----------+--> stopped
//! ```
//!
//! Any failure inside an operation moves the trainer to the terminal
//! `error` state and releases its buffers. Pause and stop requests made
//! through a [`TrainerControl`] are observed between minibatches only.

pub mod evaluator;
pub mod schedule;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use evaluator::{EvaluationPolicy, EvaluationRecord, Evaluator};
pub use schedule::{BlurSchedule, LearningRateDecay};

use crate::augment::AugmentationPipeline;
use crate::checkpoint::Checkpointable;
use crate::config::TrainingScript;
use crate::error::{TexelError, TexelResult};
use crate::export::{ExportedModel, TrainingSummary};
use crate::logging::RunLog;
use crate::network::{Network, NetworkBackup};
use crate::problem::{Problem, ProviderRegistry};
use crate::substrate::{Buffer, ComputeContext};

const PROBLEM_SEED_OFFSET: u64 = 1;
const AUGMENTATION_SEED_OFFSET: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    NotLoaded,
    Loading,
    Running,
    Paused,
    Stopped,
    Error,
}

impl TrainerState {
    pub fn name(self) -> &'static str {
        match self {
            TrainerState::NotLoaded => "notLoaded",
            TrainerState::Loading => "loading",
            TrainerState::Running => "running",
            TrainerState::Paused => "paused",
            TrainerState::Stopped => "stopped",
            TrainerState::Error => "error",
        }
    }
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cloneable handle for requesting a pause or stop from outside the loop.
#[derive(Debug, Clone, Default)]
pub struct TrainerControl {
    pause: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl TrainerControl {
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::AcqRel)
    }

    fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    fn clear(&self) {
        self.pause.store(false, Ordering::Release);
        self.stop.store(false, Ordering::Release);
    }
}

/// Receives the completion percentage, never decreasing.
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Where a run or step left the trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub state: TrainerState,
    pub minibatches: usize,
    pub samples: usize,
    pub progress: f32,
    pub best: Option<EvaluationRecord>,
}

/// Everything allocated by `load` and released by `stop`.
struct Session {
    ctx: Arc<ComputeContext>,
    network: Network,
    problem: Problem,
    augmentation: AugmentationPipeline,
    augment_rng: StdRng,
    blur_scratch: Buffer,
    blurred_expected: Buffer,
}

impl Session {
    fn build(script: &TrainingScript, registry: &ProviderRegistry) -> TexelResult<Self> {
        let provider = script.validate(registry)?;
        let training = &script.training;
        let ctx = ComputeContext::new("trainer")?;

        let mut network = Network::new(
            Arc::clone(&ctx),
            &script.network.layers,
            training.cost,
            training.seed,
        )?;
        if let Some(path) = &training.backup_path {
            let backup = NetworkBackup::load_checkpoint(path)?;
            network.restore(&backup)?;
            tracing::info!(path = %path.display(), "weights restored from checkpoint");
        }

        let problem_config = &script.problem;
        let mut problem = Problem::new(
            provider,
            problem_config.pool,
            problem_config.background,
            problem_config.test_samples,
            training.seed.wrapping_add(PROBLEM_SEED_OFFSET),
            problem_config.test_seed,
        );
        problem.prepare(&ctx)?;

        let augmentation =
            AugmentationPipeline::new(&ctx, &script.augmentation, network.input_side())?;
        let output_side = network.output_side();
        let blur_scratch = ctx.buffer(output_side)?;
        let blurred_expected = ctx.buffer(output_side)?;
        Ok(Self {
            ctx,
            network,
            problem,
            augmentation,
            augment_rng: StdRng::seed_from_u64(training.seed.wrapping_add(AUGMENTATION_SEED_OFFSET)),
            blur_scratch,
            blurred_expected,
        })
    }

    /// Forward and backward over one minibatch, then one update.
    fn train_minibatch(&mut self, script: &TrainingScript, minibatch: usize) -> TexelResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let training = &script.training;
        let input_blur = script.schedule.input_blur_at(minibatch);
        let output_blur = script.schedule.output_blur_at(minibatch);
        for _ in 0..training.minibatch_size {
            let mut sample = self.problem.next_sample(&ctx)?;
            self.augmentation
                .apply(&ctx, &mut self.augment_rng, &mut sample.input)?;
            self.network.forward(&sample.input, input_blur)?;
            let expected = if output_blur > 0.0 {
                ctx.kernels.gaussian_blur(
                    &ctx.device,
                    &sample.expected,
                    &mut self.blur_scratch,
                    &mut self.blurred_expected,
                    output_blur,
                )?;
                &self.blurred_expected
            } else {
                &sample.expected
            };
            self.network
                .backward(expected, &sample.delta_mask, &sample.clamp_mask)?;
        }
        self.network.update(
            &training.layer_rates(minibatch),
            training.momentum,
            training.minibatch_size,
        )?;
        tracing::debug!(minibatch, input_blur, output_blur, "minibatch complete");
        Ok(())
    }

    /// Success rate and mean masked error over the held-out set.
    fn test(&mut self, input_blur: f32) -> TexelResult<(f32, f32)> {
        let ctx = Arc::clone(&self.ctx);
        let samples = self.problem.test_set(&ctx)?;
        let criterion = self.problem.provider().success_criterion();
        let mut successes = 0usize;
        let mut error = 0.0;
        for sample in &samples {
            self.network.forward(&sample.input, input_blur)?;
            error += self.network.error(&sample.expected, &sample.delta_mask)?;
            let output = ctx.device.read(self.network.output())?;
            let expected = ctx.device.read(&sample.expected)?;
            let mask = ctx.device.read(&sample.delta_mask)?;
            if criterion.is_success(&output, &expected, &mask) {
                successes += 1;
            }
        }
        let count = samples.len().max(1) as f32;
        Ok((successes as f32 / count, error / count))
    }
}

/// Drives a training script through load, run, pause, step, stop and reset.
pub struct Trainer {
    registry: ProviderRegistry,
    control: TrainerControl,
    state: TrainerState,
    script: Option<TrainingScript>,
    session: Option<Session>,
    evaluator: Evaluator,
    minibatch: usize,
    samples: usize,
    progress: f32,
    progress_callback: Option<ProgressCallback>,
    best_model: Option<ExportedModel>,
    run_log: Option<RunLog>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("state", &self.state)
            .field("minibatch", &self.minibatch)
            .field("samples", &self.samples)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Trainer {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            control: TrainerControl::default(),
            state: TrainerState::NotLoaded,
            script: None,
            session: None,
            evaluator: Evaluator::new(EvaluationPolicy::default()),
            minibatch: 0,
            samples: 0,
            progress: 0.0,
            progress_callback: None,
            best_model: None,
            run_log: None,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn control(&self) -> TrainerControl {
        self.control.clone()
    }

    pub fn script(&self) -> Option<&TrainingScript> {
        self.script.as_ref()
    }

    /// Minibatches completed since load or reset.
    pub fn minibatch(&self) -> usize {
        self.minibatch
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// The network while buffers are held (between load and stop).
    pub fn network(&self) -> Option<&Network> {
        self.session.as_ref().map(|session| &session.network)
    }

    pub fn context(&self) -> Option<&Arc<ComputeContext>> {
        self.session.as_ref().map(|session| &session.ctx)
    }

    /// The last exported best snapshot. Survives `stop`.
    pub fn best_model(&self) -> Option<&ExportedModel> {
        self.best_model.as_ref()
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    fn expect_state(&self, operation: &'static str, allowed: &[TrainerState]) -> TexelResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TexelError::InvalidTransition {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn fail(&mut self, err: TexelError) -> TexelError {
        tracing::error!(category = err.category(), error = %err, "trainer entered error state");
        self.state = TrainerState::Error;
        self.session = None;
        err
    }

    fn reset_counters(&mut self, policy: EvaluationPolicy) {
        self.evaluator = Evaluator::new(policy);
        self.minibatch = 0;
        self.samples = 0;
        self.progress = 0.0;
        self.best_model = None;
        self.control.clear();
    }

    /// Validates the script, allocates every buffer and leaves the trainer
    /// paused at minibatch zero.
    pub fn load(&mut self, script: TrainingScript) -> TexelResult<()> {
        self.expect_state("load", &[TrainerState::NotLoaded, TrainerState::Stopped])?;
        self.state = TrainerState::Loading;
        let loaded = Session::build(&script, &self.registry).and_then(|session| {
            let run_log = match &script.output.log_dir {
                Some(dir) => Some(RunLog::open(dir)?),
                None => None,
            };
            Ok((session, run_log))
        });
        let (session, run_log) = loaded.map_err(|err| self.fail(err))?;
        tracing::info!(
            provider = session.problem.provider().name(),
            parameters = session.network.parameter_count(),
            minibatches = script.training.minibatches,
            "training script loaded"
        );
        self.reset_counters(script.training.evaluation);
        self.session = Some(session);
        self.run_log = run_log;
        self.script = Some(script);
        self.state = TrainerState::Paused;
        Ok(())
    }

    /// Parses and loads a TOML script.
    pub fn load_str(&mut self, toml_str: &str) -> TexelResult<()> {
        self.expect_state("load", &[TrainerState::NotLoaded, TrainerState::Stopped])?;
        match toml_str.parse::<TrainingScript>() {
            Ok(script) => self.load(script),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Trains until the budget is spent or a pause or stop is requested.
    pub fn run(&mut self) -> TexelResult<TrainingReport> {
        self.expect_state("run", &[TrainerState::Paused])?;
        self.state = TrainerState::Running;
        tracing::info!(minibatch = self.minibatch, "training running");
        loop {
            if self.control.take_stop() {
                self.stop()?;
                break;
            }
            if self.control.take_pause() {
                self.state = TrainerState::Paused;
                tracing::info!(minibatch = self.minibatch, "training paused");
                break;
            }
            if let Err(err) = self.advance() {
                return Err(self.fail(err));
            }
            if self.state == TrainerState::Stopped {
                break;
            }
        }
        Ok(self.report())
    }

    /// Stops a running loop at the next minibatch boundary. Between runs the
    /// trainer is already paused; use [`TrainerControl::pause`] from a
    /// progress callback or another thread to interrupt `run`.
    pub fn pause(&mut self) -> TexelResult<()> {
        self.expect_state("pause", &[TrainerState::Running, TrainerState::Paused])?;
        self.state = TrainerState::Paused;
        Ok(())
    }

    /// Executes exactly one minibatch while paused.
    pub fn step(&mut self) -> TexelResult<TrainingReport> {
        self.expect_state("step", &[TrainerState::Paused])?;
        if let Err(err) = self.advance() {
            return Err(self.fail(err));
        }
        Ok(self.report())
    }

    /// Ends the run and releases every buffer. The best snapshot is kept.
    pub fn stop(&mut self) -> TexelResult<()> {
        self.expect_state(
            "stop",
            &[
                TrainerState::Loading,
                TrainerState::Running,
                TrainerState::Paused,
                TrainerState::Stopped,
            ],
        )?;
        if self.state != TrainerState::Stopped {
            self.session = None;
            self.state = TrainerState::Stopped;
            tracing::info!(minibatch = self.minibatch, "training stopped, buffers released");
        }
        Ok(())
    }

    /// Rebuilds the loaded script from scratch: fresh weights from the
    /// script seed, empty pool, zero counters and a new evaluator.
    pub fn reset(&mut self) -> TexelResult<()> {
        self.expect_state("reset", &[TrainerState::Paused, TrainerState::Stopped])?;
        let Some(script) = self.script.take() else {
            return Err(TexelError::InvalidTransition {
                operation: "reset",
                state: self.state.name(),
            });
        };
        self.session = None;
        self.state = TrainerState::Stopped;
        self.load(script)?;
        tracing::info!("trainer reset");
        Ok(())
    }

    fn report(&self) -> TrainingReport {
        TrainingReport {
            state: self.state,
            minibatches: self.minibatch,
            samples: self.samples,
            progress: self.progress,
            best: self.evaluator.best_record(),
        }
    }

    /// One minibatch plus whatever periodic work falls due after it.
    fn advance(&mut self) -> TexelResult<()> {
        let (Some(script), Some(session)) = (self.script.as_ref(), self.session.as_mut()) else {
            return Err(TexelError::InvalidTransition {
                operation: "step",
                state: self.state.name(),
            });
        };
        let training = &script.training;
        let budget = training.minibatches;
        let validate_every = training.validate_every;
        let test_every = training.test_every;

        session.train_minibatch(script, self.minibatch)?;
        self.minibatch += 1;
        self.samples += training.minibatch_size;

        if validate_every > 0 && self.minibatch % validate_every == 0 {
            session.network.validate_finite()?;
        }
        let complete = self.minibatch >= budget;
        if complete || (test_every > 0 && self.minibatch % test_every == 0) {
            self.evaluate()?;
        }
        self.report_progress(complete);
        if complete {
            self.finish();
        }
        Ok(())
    }

    fn evaluate(&mut self) -> TexelResult<EvaluationRecord> {
        let (Some(script), Some(session)) = (self.script.as_ref(), self.session.as_mut()) else {
            return Err(TexelError::InvalidTransition {
                operation: "evaluate",
                state: self.state.name(),
            });
        };
        // a snapshot must never carry corrupted weights
        session.network.validate_finite()?;
        let input_blur = script.schedule.input_blur_at(self.minibatch);
        let (success_rate, error) = session.test(input_blur)?;
        let record = self.evaluator.consider(self.minibatch, success_rate, error);
        let provider = session.problem.provider();
        tracing::info!(
            minibatch = record.minibatch,
            success_rate,
            error,
            best = record.best,
            "evaluation"
        );
        if let Some(log) = &self.run_log {
            log.log_evaluation(provider.name(), self.samples, &record)?;
        }
        if record.best {
            let summary = TrainingSummary {
                provider: provider.name().to_string(),
                policy: self.evaluator.policy(),
                minibatches: self.minibatch,
                samples: self.samples,
                success_rate,
                error,
                snapshot_index: self.minibatch,
            };
            let model = session
                .network
                .export(provider.export_metadata(), Some(summary))?;
            if let Some(path) = &script.output.export_path {
                model.write(path)?;
                tracing::info!(path = %path.display(), "best snapshot exported");
            }
            if let Some(path) = &script.output.checkpoint_path {
                session.network.backup()?.save_checkpoint(path)?;
            }
            self.best_model = Some(model);
        }
        Ok(record)
    }

    fn report_progress(&mut self, force: bool) {
        let (budget, every) = match &self.script {
            Some(script) => (
                script.training.minibatches.max(1),
                script.output.progress_every.max(1),
            ),
            None => return,
        };
        let percent = (100.0 * self.minibatch as f32 / budget as f32).min(100.0);
        self.progress = self.progress.max(percent);
        if force || self.minibatch % every == 0 {
            if let Some(callback) = &mut self.progress_callback {
                callback(self.progress);
            }
        }
    }

    fn finish(&mut self) {
        self.session = None;
        self.state = TrainerState::Stopped;
        match self.evaluator.best_record() {
            Some(best) => tracing::info!(
                minibatches = self.minibatch,
                best_minibatch = best.minibatch,
                success_rate = best.success_rate,
                error = best.error,
                "training complete"
            ),
            None => tracing::warn!(minibatches = self.minibatch, "training complete without evaluation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    const XOR: &str = r#"
        [network]
        layers = [
            { type = "input", size = 1, neurons = 4 },
            { type = "neuron", size = 1, neurons = 2, connectivity = { kind = "full" } },
        ]

        [problem]
        provider = "xorLike"
        test_samples = 4

        [training]
        learning_rates = [0.3]
        momentum = 0.0
        minibatch_size = 4
        minibatches = 20
        test_every = 5
    "#;

    fn loaded() -> Trainer {
        let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
        trainer.load_str(XOR).unwrap();
        trainer
    }

    #[test]
    fn test_load_leaves_trainer_paused() {
        let trainer = loaded();
        assert_eq!(trainer.state(), TrainerState::Paused);
        assert_eq!(trainer.minibatch(), 0);
        assert!(trainer.network().is_some());
    }

    #[test]
    fn test_operations_require_a_loaded_script() {
        let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
        for result in [trainer.run().map(|_| ()), trainer.step().map(|_| ()), trainer.stop()] {
            assert!(matches!(
                result,
                Err(TexelError::InvalidTransition { state: "notLoaded", .. })
            ));
        }
        assert_eq!(trainer.state(), TrainerState::NotLoaded);
    }

    #[test]
    fn test_step_runs_exactly_one_minibatch() {
        let mut trainer = loaded();
        let report = trainer.step().unwrap();
        assert_eq!(report.minibatches, 1);
        assert_eq!(report.samples, 4);
        assert_eq!(report.state, TrainerState::Paused);
        assert!(trainer.evaluator().history().is_empty());
    }

    #[test]
    fn test_run_to_budget_stops_and_keeps_snapshot() {
        let mut trainer = loaded();
        let report = trainer.run().unwrap();
        assert_eq!(report.state, TrainerState::Stopped);
        assert_eq!(report.minibatches, 20);
        assert_eq!(report.progress, 100.0);
        assert_eq!(trainer.evaluator().history().len(), 4);
        assert!(trainer.network().is_none());
        let best = trainer.best_model().unwrap();
        assert_eq!(best.training.as_ref().unwrap().provider, "xorLike");
        assert!(matches!(
            trainer.step(),
            Err(TexelError::InvalidTransition { state: "stopped", .. })
        ));
    }

    #[test]
    fn test_progress_is_monotonic_and_pause_is_observed() {
        let mut trainer = loaded();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let control = trainer.control();
        let sink = Arc::clone(&seen);
        trainer.set_progress_callback(move |percent| {
            sink.lock().unwrap().push(percent);
            if percent >= 50.0 {
                control.pause();
            }
        });
        let report = trainer.run().unwrap();
        assert_eq!(report.state, TrainerState::Paused);
        assert_eq!(report.minibatches, 10);

        trainer.set_progress_callback({
            let sink = Arc::clone(&seen);
            move |percent| sink.lock().unwrap().push(percent)
        });
        let report = trainer.run().unwrap();
        assert_eq!(report.state, TrainerState::Stopped);
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[test]
    fn test_stop_request_releases_buffers() {
        let mut trainer = loaded();
        trainer.control().stop();
        let report = trainer.run().unwrap();
        assert_eq!(report.state, TrainerState::Stopped);
        assert_eq!(report.minibatches, 0);
        assert!(trainer.context().is_none());
    }

    #[test]
    fn test_reset_restarts_deterministically() {
        let mut trainer = loaded();
        for _ in 0..3 {
            trainer.step().unwrap();
        }
        let first = trainer.network().unwrap().export(serde_json::Value::Null, None).unwrap();
        trainer.reset().unwrap();
        assert_eq!(trainer.minibatch(), 0);
        assert_eq!(trainer.state(), TrainerState::Paused);
        for _ in 0..3 {
            trainer.step().unwrap();
        }
        let second = trainer.network().unwrap().export(serde_json::Value::Null, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_device_loss_is_terminal() {
        let pooled = XOR.replace(
            "test_samples = 4",
            "test_samples = 4\n        pool = { size = 2, max_uses = 1 }",
        );
        for script in [XOR.to_string(), pooled] {
            let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
            trainer.load_str(&script).unwrap();
            // fills the pool, if any, before the context goes away
            trainer.step().unwrap();
            trainer.context().unwrap().device.lose();

            let err = trainer.step().unwrap_err();
            assert_eq!(err.category(), "device", "{err}");
            assert!(matches!(err, TexelError::Device(DeviceError::ContextLost)));
            assert_eq!(trainer.state(), TrainerState::Error);
            assert!(matches!(
                trainer.run(),
                Err(TexelError::InvalidTransition { state: "error", .. })
            ));
        }
    }

    #[test]
    fn test_invalid_script_fails_before_allocation() {
        let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
        let err = trainer
            .load_str(&XOR.replace("xorLike", "nope"))
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert_eq!(trainer.state(), TrainerState::Error);
        assert!(trainer.context().is_none());
    }
}
