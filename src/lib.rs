//! Precision-mode orchestration for classifier training
//!
//! Trains a classifier under one of several numeric-precision regimes, picked
//! from a single configuration knob:
//!
//! - **Weight storage dtype**: F32 or BF16 parameters
//! - **Compute dtype**: the dtype activations and matmuls run in
//! - **Optimizer variant**: AdamW with F32 moments, or AdamW with moments kept
//!   in the parameter dtype
//! - **Stochastic rounding**: unbiased narrowing of every parameter update
//!
//! The training loop drives linear warmup followed by cosine decay, evaluates
//! on a held-out split, tracks the best accuracy and overwrites a safetensors
//! checkpoint every epoch.
//!
//! # Example
//!
//! ```ignore
//! use precision_train::{RunConfig, MlpClassifier, Trainer};
//!
//! let config = RunConfig::from_json_file("run.json")?;
//! let model = MlpClassifier::new(config.model.clone(), &device)?;
//! let trainer = Trainer::new(model, config, device)?;
//! let outcome = trainer.train(&mut train_loader, &mut test_loader, &mut sink)?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod metrics;
pub mod models;
pub mod precision;
pub mod tracking;
pub mod training;

// Re-export commonly used items
pub use config::{ComputeDevice, RunConfig};
pub use models::{Classifier, MlpClassifier, MlpConfig};
pub use precision::{PrecisionMode, PrecisionPolicy};
pub use training::{Trainer, TrainingOutcome};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainerError>;
