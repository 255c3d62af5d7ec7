//! Versioned binary backups of trained weights.
//!
//! A backup stores a version header alongside the payload so that files
//! written by an incompatible build are rejected on load. Exported models
//! (see [`crate::export`]) are the hand-off artifact; backups are only used
//! to resume or warm-start a run with identical topology.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::Options;
use thiserror::Error;

/// Errors raised while saving or loading a backup.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error while accessing checkpoint: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize checkpoint payload: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("checkpoint version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("checkpoint does not match network: {0}")]
    InvalidFormat(String),
}

/// Deterministic codec shared by every backup.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

/// Components that persist to a deterministic binary backup.
pub trait Checkpointable: Sized {
    /// Save the current state to `path`.
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError>;

    /// Load a state previously written by [`Checkpointable::save_checkpoint`].
    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError>;

    /// Writes a serializable snapshot with the shared codec, creating parent
    /// directories as needed.
    fn write_snapshot<P, T>(snapshot: &T, path: P) -> Result<(), CheckpointError>
    where
        P: AsRef<Path>,
        T: serde::Serialize,
    {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        codec().serialize_into(&mut writer, snapshot)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a snapshot written with the shared codec.
    fn read_snapshot<P, T>(path: P) -> Result<T, CheckpointError>
    where
        P: AsRef<Path>,
        T: serde::de::DeserializeOwned,
    {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Ok(codec().deserialize_from(&mut reader)?)
    }
}

/// Rejects a snapshot whose header does not match `expected`.
pub fn check_version(expected: u32, found: u32) -> Result<(), CheckpointError> {
    if expected != found {
        return Err(CheckpointError::VersionMismatch { expected, found });
    }
    Ok(())
}
