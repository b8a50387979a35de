/// Training loop for precision-mode classifier runs
use candle_core::{DType, Device, Tensor};

use crate::config::RunConfig;
use crate::data::BatchDataLoader;
use crate::models::Classifier;
use crate::precision::{AutocastGuard, PrecisionPolicy, FULL_DTYPE};
use crate::tracking::{MetricsSink, RunInfo, StepRecord};
use crate::TrainerError;
use super::checkpoint::{CheckpointMetadata, CheckpointStore};
use super::evaluator::{evaluate, Evaluation};
use super::optimizer::{build_optimizer, AdamWConfig, Optimizer};
use super::scheduler::WarmupCosineSchedule;
use super::stochastic_rounding::apply_stochastic_rounding;

/// Accuracy bookkeeping carried from one epoch into the next
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochResult {
    /// Best held-out accuracy so far; never decreases
    pub best_accuracy: f64,
    pub last_test_accuracy: Option<f64>,
    /// Only refreshed on training-set evaluation epochs
    pub last_train_accuracy: Option<f64>,
}

impl EpochResult {
    pub fn with_test_accuracy(self, accuracy: f64) -> Self {
        Self {
            best_accuracy: self.best_accuracy.max(accuracy),
            last_test_accuracy: Some(accuracy),
            ..self
        }
    }

    pub fn with_train_accuracy(self, accuracy: f64) -> Self {
        Self {
            last_train_accuracy: Some(accuracy),
            ..self
        }
    }
}

/// What a finished run hands back: the model, re-stored in F32
pub struct TrainingOutcome<M> {
    pub model: M,
    pub result: EpochResult,
}

/// Trainer for one classifier under one precision mode
pub struct Trainer<M: Classifier> {
    model: M,
    optimizer: Box<dyn Optimizer>,
    schedule: WarmupCosineSchedule,
    policy: PrecisionPolicy,
    checkpoints: CheckpointStore,
    config: RunConfig,
    device: Device,
    step: usize,
}

impl<M: Classifier> Trainer<M> {
    /// Set up a run
    ///
    /// Every configuration error surfaces here, before any training step:
    /// unknown precision mode, bad epoch counts, and a requested resume
    /// without a checkpoint on disk.
    pub fn new(mut model: M, config: RunConfig, device: Device) -> crate::Result<Self> {
        config.validate()?;
        let policy = config.precision_mode()?.resolve();
        log::info!(
            "Precision mode '{}': weights {:?}, compute {:?}, {:?} optimizer, stochastic rounding {}",
            policy.mode,
            policy.weight_dtype,
            policy.compute_dtype,
            policy.optimizer,
            if policy.stochastic_rounding { "on" } else { "off" }
        );

        let checkpoints = CheckpointStore::new(&config.model_path);
        if config.load_model {
            if !checkpoints.exists() {
                return Err(TrainerError::Config(format!(
                    "load_model is set but no checkpoint exists at {:?}",
                    checkpoints.path()
                )));
            }
            checkpoints.load_into(model.varmap(), &device)?;
        }

        // Parameters must be in their storage dtype before the optimizer
        // takes handles to them
        model.to_dtype(policy.weight_dtype)?;
        model.set_activation_recompute(policy.activation_recompute);
        model.set_training(true);

        let adamw = AdamWConfig {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = build_optimizer(model.varmap().all_vars(), policy.optimizer, adamw)?;
        let mut optimizer =
            apply_stochastic_rounding(optimizer, policy.stochastic_rounding, config.seed);

        let schedule = WarmupCosineSchedule::compose(
            optimizer.as_mut(),
            config.warmup_epochs,
            config.epochs,
            config.min_lr,
        )?;

        Ok(Self {
            model,
            optimizer,
            schedule,
            policy,
            checkpoints,
            config,
            device,
            step: 0,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Run every epoch, then hand back the model in full precision
    pub fn train(
        mut self,
        train_loader: &mut dyn BatchDataLoader,
        test_loader: &mut dyn BatchDataLoader,
        sink: &mut dyn MetricsSink,
    ) -> crate::Result<TrainingOutcome<M>> {
        sink.login()?;
        sink.init(&self.run_info()?)?;

        log::info!("Starting training for {} epochs", self.config.epochs);
        log::info!("Total batches per epoch: {}", train_loader.num_batches());

        let mut result = EpochResult::default();
        {
            let _autocast = AutocastGuard::enter(self.policy.compute_dtype);
            for epoch in 0..self.config.epochs {
                result = self.run_epoch(epoch, result, train_loader, test_loader, sink)?;
            }
        }

        log::info!("Training complete! Best test acc: {:.2}%", result.best_accuracy * 100.0);

        self.model.to_dtype(FULL_DTYPE)?;
        if let Err(e) = sink.finish() {
            log::warn!("Failed to close metrics sink: {}", e);
        }

        Ok(TrainingOutcome {
            model: self.model,
            result,
        })
    }

    fn run_info(&self) -> crate::Result<RunInfo> {
        Ok(RunInfo {
            project: self.config.project_name.clone(),
            name: self.config.run_name.clone(),
            config: serde_json::to_value(&self.config)?,
        })
    }

    /// Train one epoch and fold its evaluations into `result`
    fn run_epoch(
        &mut self,
        epoch: usize,
        result: EpochResult,
        train_loader: &mut dyn BatchDataLoader,
        test_loader: &mut dyn BatchDataLoader,
        sink: &mut dyn MetricsSink,
    ) -> crate::Result<EpochResult> {
        let epochs = self.config.epochs;
        let lr = self.optimizer.learning_rate();
        log::debug!(
            "Epoch {}/{}: {:?} phase, lr={:.6e}",
            epoch + 1,
            epochs,
            self.schedule.phase(epoch),
            lr
        );

        let evaluate_test = (epoch + 1) % self.config.eval_every == 0 || epoch + 1 == epochs;
        let evaluate_train = (epoch + 1) % self.config.train_eval_every == 0;

        self.model.set_training(true);
        train_loader.reset();
        let iter_per_epoch = train_loader.num_batches();
        let mut test_eval: Option<Evaluation> = None;
        let mut iteration = 0;

        while let Some((inputs, labels)) = train_loader.next_batch(&self.device)? {
            let loss = self.train_step(&inputs, &labels)?;
            let last = iteration + 1 == iter_per_epoch;

            let mut record = StepRecord {
                step: self.step,
                epoch,
                loss,
                lr,
                acc: None,
            };
            if last && evaluate_test {
                let eval = self.evaluate(test_loader)?;
                record.acc = Some(eval.accuracy);
                test_eval = Some(eval);
            }
            if let Err(e) = sink.log(&record) {
                log::warn!("Failed to log step {}: {}", self.step, e);
            }

            if iteration % self.config.log_every == 0 || last {
                log::info!(
                    "Ep: {}/{}, It: {}/{}, loss: {:.4}",
                    epoch + 1,
                    epochs,
                    iteration + 1,
                    iter_per_epoch,
                    loss
                );
            }
            iteration += 1;
        }

        if iteration == 0 {
            return Err(TrainerError::Training("training split produced no batches".to_string()));
        }

        let mut result = result;
        if evaluate_train {
            let eval = self.evaluate(train_loader)?;
            log::info!("Train acc: {:.2}%\nTrain Confusion Matrix:\n{}", eval.accuracy * 100.0, eval.confusion);
            result = result.with_train_accuracy(eval.accuracy);
        }
        if evaluate_test {
            // Parameters are unchanged since the last-batch evaluation
            let eval = match test_eval {
                Some(eval) => eval,
                None => self.evaluate(test_loader)?,
            };
            log::info!("Test acc: {:.2}%\nTest Confusion Matrix:\n{}", eval.accuracy * 100.0, eval.confusion);
            result = result.with_test_accuracy(eval.accuracy);
        }
        log::info!("Best test acc: {:.2}%", result.best_accuracy * 100.0);

        let metadata = CheckpointMetadata {
            epoch,
            lr,
            best_accuracy: result.best_accuracy,
            precision: self.policy.mode.to_string(),
        };
        if let Err(e) = self.checkpoints.save(self.model.varmap(), &metadata) {
            log::warn!("Failed to save checkpoint after epoch {}: {}", epoch + 1, e);
        }

        self.schedule.step(epoch, self.optimizer.as_mut());
        Ok(result)
    }

    /// Forward, loss, backward and parameter update for one batch
    fn train_step(&mut self, inputs: &Tensor, labels: &Tensor) -> crate::Result<f32> {
        let logits = self.model.forward(inputs)?;
        // Loss is always reduced in F32
        let loss = candle_nn::loss::cross_entropy(&logits.to_dtype(DType::F32)?, labels)?;

        self.optimizer.zero_grad();
        self.optimizer.backward_step(&loss)?;
        self.step += 1;

        let loss_val = loss.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            log::warn!("Non-finite loss at step {}: {}", self.step, loss_val);
        }
        Ok(loss_val)
    }

    fn evaluate(&mut self, loader: &mut dyn BatchDataLoader) -> crate::Result<Evaluation> {
        evaluate(&mut self.model, loader, self.config.n_classes, &self.device)
    }
}
