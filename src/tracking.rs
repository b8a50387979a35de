/// Experiment-tracking sinks
///
/// The training loop only ever writes to a sink; nothing is read back.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::TrainerError;

/// Identifies a run to the tracking backend
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub project: String,
    pub name: String,
    /// Hyperparameters and run metadata
    pub config: serde_json::Value,
}

/// One per-step record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub epoch: usize,
    pub loss: f32,
    pub lr: f64,
    /// Held-out accuracy, only on the last batch of an epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
}

/// Write-only key/value log with a login/init lifecycle
pub trait MetricsSink {
    fn login(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn init(&mut self, run: &RunInfo) -> crate::Result<()>;

    fn log(&mut self, record: &StepRecord) -> crate::Result<()>;

    fn finish(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn init(&mut self, _run: &RunInfo) -> crate::Result<()> {
        Ok(())
    }

    fn log(&mut self, _record: &StepRecord) -> crate::Result<()> {
        Ok(())
    }
}

/// Appends JSON lines to a file: one header line per run, then one per step
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> crate::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TrainerError::Tracking("sink used before init".to_string()))?;
        serde_json::to_writer(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl MetricsSink for JsonlSink {
    fn login(&mut self) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn init(&mut self, run: &RunInfo) -> crate::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        log::info!("Tracking run '{}/{}' in {:?}", run.project, run.name, self.path);
        self.write_line(&serde_json::json!({ "run": run }))
    }

    fn log(&mut self, record: &StepRecord) -> crate::Result<()> {
        self.write_line(record)
    }

    fn finish(&mut self) -> crate::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
