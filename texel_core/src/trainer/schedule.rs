//! Hyperparameter schedules over elapsed minibatches.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Exponentially annealed blur radius:
/// `end + (start - end) · 2^(-t / half_life)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlurSchedule {
    pub start: f32,
    #[serde(default)]
    pub end: f32,
    /// Minibatches for the excess over `end` to halve. Zero jumps straight
    /// to `end`.
    #[serde(default)]
    pub half_life: f32,
}

impl BlurSchedule {
    pub fn constant(sigma: f32) -> Self {
        Self {
            start: sigma,
            end: sigma,
            half_life: 0.0,
        }
    }

    pub fn at(&self, minibatch: usize) -> f32 {
        if self.half_life <= 0.0 {
            return self.end;
        }
        let decay = (-(minibatch as f32) / self.half_life).exp2();
        self.end + (self.start - self.end) * decay
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        for (field, value) in [("start", self.start), ("end", self.end), ("half_life", self.half_life)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ConfigurationError::parameter(
                    format!("schedule.{name}.{field}"),
                    value,
                    "finite and >= 0",
                ));
            }
        }
        Ok(())
    }
}

/// Step decay of every learning rate: multiplied by `factor` once per
/// `every` minibatches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRateDecay {
    pub factor: f32,
    pub every: usize,
}

impl LearningRateDecay {
    pub fn multiplier(&self, minibatch: usize) -> f32 {
        if self.every == 0 {
            return 1.0;
        }
        let steps = (minibatch / self.every).min(i32::MAX as usize) as i32;
        self.factor.powi(steps)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.factor > 0.0 && self.factor <= 1.0) {
            return Err(ConfigurationError::parameter(
                "training.lr_decay.factor",
                self.factor,
                "0 < factor <= 1",
            ));
        }
        if self.every == 0 {
            return Err(ConfigurationError::parameter(
                "training.lr_decay.every",
                self.every,
                "every >= 1",
            ));
        }
        Ok(())
    }
}
