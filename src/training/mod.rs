/// Training infrastructure: optimizers, rounding, schedule, evaluation,
/// checkpoints and the epoch loop
pub mod optimizer;
pub mod stochastic_rounding;
pub mod scheduler;
pub mod evaluator;
pub mod checkpoint;
pub mod trainer;

pub use optimizer::{build_optimizer, AdamW, AdamWConfig, Optimizer, ReducedAdamW};
pub use stochastic_rounding::{apply_stochastic_rounding, StochasticRounding};
pub use scheduler::{SchedulePhase, WarmupCosineSchedule};
pub use evaluator::{evaluate, Evaluation};
pub use checkpoint::{CheckpointMetadata, CheckpointStore};
pub use trainer::{EpochResult, Trainer, TrainingOutcome};
