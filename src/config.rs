/// Run configuration
///
/// One JSON document describes a whole training run. Every field has a
/// default so partial files are accepted; `validate` rejects inconsistent
/// combinations before any training step runs.
use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::models::MlpConfig;
use crate::precision::PrecisionMode;
use crate::TrainerError;

/// Where tensors should live
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Accelerator,
    Host,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Precision mode name, see `PrecisionMode`
    pub precision: String,

    /// Peak learning rate, reached at the end of warmup
    pub lr: f64,

    /// Floor of the cosine decay
    pub min_lr: f64,

    /// Decoupled weight decay
    pub weight_decay: f64,

    /// Number of linear warmup epochs (>= 1)
    pub warmup_epochs: usize,

    /// Total epochs (> warmup_epochs)
    pub epochs: usize,

    /// Size of the label space
    pub n_classes: usize,

    /// Examples per training and evaluation batch
    pub batch_size: usize,

    /// Run directory holding the checkpoint and metrics log
    pub model_path: PathBuf,

    /// Resume parameters from the checkpoint in `model_path`
    pub load_model: bool,

    pub compute_device: ComputeDevice,

    /// Evaluate on the held-out split every N epochs
    pub eval_every: usize,

    /// Evaluate on the training split every N epochs
    pub train_eval_every: usize,

    /// Console progress every N iterations
    pub log_every: usize,

    /// Seed for the stochastic rounding source
    pub seed: Option<u64>,

    /// Experiment-tracking project
    pub project_name: String,

    /// Experiment-tracking run
    pub run_name: String,

    /// Bundled classifier architecture
    pub model: MlpConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            precision: "full".to_string(),
            lr: 1e-3,
            min_lr: 1e-5,
            weight_decay: 1e-3,
            warmup_epochs: 10,
            epochs: 200,
            n_classes: 10,
            batch_size: 128,
            model_path: PathBuf::from("./model"),
            load_model: false,
            compute_device: ComputeDevice::Accelerator,
            eval_every: 1,
            train_eval_every: 25,
            log_every: 50,
            seed: None,
            project_name: "precision-train".to_string(),
            run_name: "run".to_string(),
            model: MlpConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    /// Parsed precision mode
    pub fn precision_mode(&self) -> crate::Result<PrecisionMode> {
        self.precision.parse()
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.precision_mode()?;

        if self.warmup_epochs == 0 {
            return Err(TrainerError::Config(
                "warmup_epochs must be >= 1".to_string(),
            ));
        }

        if self.warmup_epochs >= self.epochs {
            return Err(TrainerError::Config(format!(
                "epochs ({}) must be greater than warmup_epochs ({})",
                self.epochs, self.warmup_epochs
            )));
        }

        if self.n_classes < 2 {
            return Err(TrainerError::Config(
                "n_classes must be >= 2".to_string(),
            ));
        }

        if !(self.lr > 0.0) {
            return Err(TrainerError::Config(format!("lr must be > 0, got {}", self.lr)));
        }

        if self.min_lr < 0.0 || self.min_lr > self.lr {
            return Err(TrainerError::Config(format!(
                "min_lr ({}) must lie in [0, lr ({})]",
                self.min_lr, self.lr
            )));
        }

        if self.batch_size == 0 {
            return Err(TrainerError::Config("batch_size must be >= 1".to_string()));
        }

        if self.eval_every == 0 || self.train_eval_every == 0 || self.log_every == 0 {
            return Err(TrainerError::Config(
                "eval_every, train_eval_every and log_every must be >= 1".to_string(),
            ));
        }

        if self.model.n_classes != self.n_classes {
            return Err(TrainerError::Config(format!(
                "model.n_classes ({}) does not match n_classes ({})",
                self.model.n_classes, self.n_classes
            )));
        }

        Ok(())
    }
}

/// Pick the device for a run
///
/// An accelerator that cannot be opened is not fatal: the run continues on
/// the host with a warning.
pub fn select_device(requested: ComputeDevice) -> Device {
    match requested {
        ComputeDevice::Host => Device::Cpu,
        ComputeDevice::Accelerator => {
            if !candle_core::utils::cuda_is_available() {
                log::warn!("Accelerator requested but CUDA is not available, using host");
                return Device::Cpu;
            }
            match Device::new_cuda(0) {
                Ok(device) => device,
                Err(e) => {
                    log::warn!("Failed to open CUDA device ({}), using host", e);
                    Device::Cpu
                }
            }
        }
    }
}
