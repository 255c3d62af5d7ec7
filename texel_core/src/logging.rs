use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::trainer::EvaluationRecord;

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

#[derive(Debug, Serialize)]
pub struct EvaluationLogEntry {
    pub provider: String,
    pub minibatch: usize,
    pub samples: usize,
    pub success_rate: f32,
    pub error: f32,
    pub best: bool,
    pub timestamp_ms: u128,
}

/// Append-only JSONL log of a training run.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    /// Creates `dir` if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn evaluations_path(&self) -> PathBuf {
        self.dir.join("evaluations.jsonl")
    }

    pub fn log_evaluation(
        &self,
        provider: &str,
        samples: usize,
        record: &EvaluationRecord,
    ) -> io::Result<()> {
        let entry = EvaluationLogEntry {
            provider: provider.to_string(),
            minibatch: record.minibatch,
            samples,
            success_rate: record.success_rate,
            error: record.error,
            best: record.best,
            timestamp_ms: timestamp_ms(),
        };
        append_json_line(self.evaluations_path(), &entry)
    }
}
