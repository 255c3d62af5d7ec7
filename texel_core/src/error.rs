//! Error taxonomy for the engine.
//!
//! Four families map onto the failure classes a training run can hit:
//!
//! - [`ConfigurationError`]: invalid geometry, provider or cost at load time.
//!   Never recoverable; training never starts.
//! - [`DeviceError`]: the compute context was lost or a kernel call was
//!   malformed. Fatal to the run.
//! - [`NumericError`]: NaN or infinity found in a weight or delta buffer.
//! - [`SampleGenerationError`]: a provider failed to produce a sample.
//!
//! [`TexelError`] wraps all of them and is what the trainer state machine
//! surfaces to its caller.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Result alias used throughout the crate.
pub type TexelResult<T> = Result<T, TexelError>;

/// Invalid training script, geometry, provider or cost.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("failed to parse training script: {0}")]
    Parse(String),

    #[error("invalid {connectivity} geometry ({from}x{from} -> {to}x{to}): {reason}")]
    InvalidGeometry {
        connectivity: &'static str,
        from: usize,
        to: usize,
        reason: String,
    },

    #[error("layer {index}: {reason}")]
    InvalidLayer { index: usize, reason: String },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("invalid options for provider '{provider}': {reason}")]
    InvalidProviderOptions { provider: String, reason: String },

    #[error("cost function {cost} cannot be used here: {reason}")]
    IncompatibleCost { cost: String, reason: String },

    #[error("invalid parameter '{parameter}' = {value}: must satisfy {constraint}")]
    InvalidParameter {
        parameter: String,
        value: String,
        constraint: String,
    },

    #[error("buffer side {side} is invalid: {reason}")]
    InvalidBuffer { side: usize, reason: String },
}

impl ConfigurationError {
    pub(crate) fn parameter(
        parameter: impl Into<String>,
        value: impl ToString,
        constraint: impl Into<String>,
    ) -> Self {
        ConfigurationError::InvalidParameter {
            parameter: parameter.into(),
            value: value.to_string(),
            constraint: constraint.into(),
        }
    }
}

/// Failures of the compute substrate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("compute context lost")]
    ContextLost,

    #[error("kernel '{kernel}' expects {expected} bound inputs, got {got}")]
    InputCount {
        kernel: String,
        expected: usize,
        got: usize,
    },

    #[error("kernel '{kernel}' is missing uniform '{name}'")]
    MissingUniform { kernel: String, name: String },

    #[error("kernel '{kernel}' does not declare uniform '{name}'")]
    UnknownUniform { kernel: String, name: String },

    #[error("kernel source '{kernel}' is invalid: {reason}")]
    InvalidKernel { kernel: String, reason: String },

    #[error("buffer of side {got} bound where side {expected} is required ({context})")]
    SideMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("no compatible adapter available")]
    AdapterUnavailable,

    #[error("backend failure: {0}")]
    Backend(String),
}

/// A buffer holds a non-finite value.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("non-finite value in {buffer} of layer {layer} at index {index}")]
pub struct NumericError {
    pub buffer: String,
    pub layer: usize,
    pub index: usize,
}

/// A provider could not produce a sample and no pooled fallback existed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleGenerationError {
    #[error("provider '{provider}' failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("provider '{provider}' produced a sample of side {got}, expected {expected} ({buffer})")]
    Shape {
        provider: String,
        buffer: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Umbrella error surfaced by network and trainer operations.
#[derive(Debug, Error)]
pub enum TexelError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Numeric(#[from] NumericError),

    #[error(transparent)]
    SampleGeneration(SampleGenerationError),

    #[error("cannot {operation} while trainer is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("exported model is invalid: {0}")]
    InvalidExport(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A lost context is fatal whichever operation hit it, so it is never
/// reported as a sample-generation failure.
impl From<SampleGenerationError> for TexelError {
    fn from(err: SampleGenerationError) -> Self {
        match err {
            SampleGenerationError::Device(err) => TexelError::Device(err),
            other => TexelError::SampleGeneration(other),
        }
    }
}

impl TexelError {
    /// Short category name used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            TexelError::Configuration(_) => "configuration",
            TexelError::Device(_) => "device",
            TexelError::Numeric(_) => "numeric",
            TexelError::SampleGeneration(_) => "sample-generation",
            TexelError::InvalidTransition { .. } => "transition",
            TexelError::InvalidExport(_) => "export",
            TexelError::Checkpoint(_) => "checkpoint",
            TexelError::Io(_) => "io",
            TexelError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_message_mentions_sides() {
        let err = ConfigurationError::InvalidGeometry {
            connectivity: "conv",
            from: 8,
            to: 3,
            reason: "stride 8/3 is not integral".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("8x8 -> 3x3"));
        assert!(msg.contains("not integral"));
    }

    #[test]
    fn test_umbrella_category() {
        let err: TexelError = DeviceError::ContextLost.into();
        assert_eq!(err.category(), "device");
        let err: TexelError = ConfigurationError::UnknownProvider("nope".into()).into();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_device_loss_during_generation_is_a_device_error() {
        let err: TexelError = SampleGenerationError::Device(DeviceError::ContextLost).into();
        assert!(matches!(err, TexelError::Device(DeviceError::ContextLost)));
        let err: TexelError = SampleGenerationError::Provider {
            provider: "glyphs".into(),
            reason: "empty".into(),
        }
        .into();
        assert_eq!(err.category(), "sample-generation");
    }
}
