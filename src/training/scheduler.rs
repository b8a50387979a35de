/// Epoch-driven learning rate schedule: linear warmup, then cosine decay
use std::f64::consts::PI;

use super::optimizer::Optimizer;
use crate::TrainerError;

/// Which phase an epoch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Warmup,
    Decay,
}

/// One phase of a schedule, advanced once per epoch
pub trait LrPhase {
    /// Learning rate `epochs` steps into this phase
    fn lr_at(&self, epochs: usize) -> f64;

    /// Steps taken so far
    fn last_epoch(&self) -> usize;

    fn step(&mut self);

    /// Learning rate for the current step
    fn lr(&self) -> f64 {
        self.lr_at(self.last_epoch())
    }
}

/// Linear ramp from `base_lr / warmup_epochs` to `base_lr`
///
/// Reaches `base_lr` at step `warmup_epochs - 1` and stays there.
#[derive(Debug, Clone)]
pub struct LinearWarmup {
    base_lr: f64,
    warmup_epochs: usize,
    epoch: usize,
}

impl LinearWarmup {
    pub fn new(base_lr: f64, warmup_epochs: usize) -> Self {
        Self {
            base_lr,
            warmup_epochs: warmup_epochs.max(1),
            epoch: 0,
        }
    }
}

impl LrPhase for LinearWarmup {
    fn lr_at(&self, epochs: usize) -> f64 {
        let start_factor = 1.0 / self.warmup_epochs as f64;
        if self.warmup_epochs == 1 {
            return self.base_lr;
        }
        let progress = epochs.min(self.warmup_epochs - 1) as f64 / (self.warmup_epochs - 1) as f64;
        self.base_lr * (start_factor + (1.0 - start_factor) * progress)
    }

    fn last_epoch(&self) -> usize {
        self.epoch
    }

    fn step(&mut self) {
        self.epoch += 1;
    }
}

/// Cosine annealing from `base_lr` to `min_lr` over `decay_epochs` epochs
///
/// The first decay epoch runs at `base_lr`, the last at `min_lr`.
#[derive(Debug, Clone)]
pub struct CosineDecay {
    base_lr: f64,
    min_lr: f64,
    decay_epochs: usize,
    epoch: usize,
}

impl CosineDecay {
    pub fn new(base_lr: f64, min_lr: f64, decay_epochs: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            decay_epochs: decay_epochs.max(1),
            epoch: 0,
        }
    }
}

impl LrPhase for CosineDecay {
    fn lr_at(&self, epochs: usize) -> f64 {
        // A single decay epoch is also the final one
        if self.decay_epochs == 1 {
            return self.min_lr;
        }
        let progress = epochs.min(self.decay_epochs - 1) as f64 / (self.decay_epochs - 1) as f64;

        // lr = lr_min + (lr_init - lr_min) * 0.5 * (1 + cos(pi * progress))
        let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine_factor
    }

    fn last_epoch(&self) -> usize {
        self.epoch
    }

    fn step(&mut self) {
        self.epoch += 1;
    }
}

/// Warmup and decay phases sharing one optimizer
///
/// The caller reports which epoch just finished; the schedule routes the
/// step to the matching phase and writes the new rate into the optimizer.
#[derive(Debug, Clone)]
pub struct WarmupCosineSchedule {
    warmup: LinearWarmup,
    decay: CosineDecay,
    warmup_epochs: usize,
    total_epochs: usize,
}

impl WarmupCosineSchedule {
    /// Build the schedule around `optimizer`'s current learning rate and set
    /// the optimizer to the first warmup rate
    pub fn compose(
        optimizer: &mut dyn Optimizer,
        warmup_epochs: usize,
        total_epochs: usize,
        min_lr: f64,
    ) -> crate::Result<Self> {
        if warmup_epochs == 0 || warmup_epochs >= total_epochs {
            return Err(TrainerError::Config(format!(
                "schedule needs 1 <= warmup_epochs ({}) < total_epochs ({})",
                warmup_epochs, total_epochs
            )));
        }

        let base_lr = optimizer.learning_rate();
        if min_lr > base_lr {
            return Err(TrainerError::Config(format!(
                "min_lr ({}) exceeds base learning rate ({})",
                min_lr, base_lr
            )));
        }

        let schedule = Self {
            warmup: LinearWarmup::new(base_lr, warmup_epochs),
            decay: CosineDecay::new(base_lr, min_lr, total_epochs - warmup_epochs),
            warmup_epochs,
            total_epochs,
        };
        optimizer.set_learning_rate(schedule.warmup.lr());
        Ok(schedule)
    }

    pub fn phase(&self, epoch: usize) -> SchedulePhase {
        if epoch < self.warmup_epochs {
            SchedulePhase::Warmup
        } else {
            SchedulePhase::Decay
        }
    }

    /// Learning rate the run uses during `epoch`
    pub fn lr_at_epoch(&self, epoch: usize) -> f64 {
        match self.phase(epoch) {
            SchedulePhase::Warmup => self.warmup.lr_at(epoch),
            SchedulePhase::Decay => self.decay.lr_at(epoch - self.warmup_epochs),
        }
    }

    /// Advance after `finished_epoch` and update the optimizer's rate
    pub fn step(&mut self, finished_epoch: usize, optimizer: &mut dyn Optimizer) -> f64 {
        let lr = match self.phase(finished_epoch) {
            SchedulePhase::Warmup => {
                self.warmup.step();
                self.warmup.lr()
            }
            SchedulePhase::Decay => {
                self.decay.step();
                self.decay.lr()
            }
        };
        optimizer.set_learning_rate(lr);
        log::debug!("Epoch {} done, learning rate -> {:.6e}", finished_epoch + 1, lr);
        lr
    }

    pub fn warmup_epochs(&self) -> usize {
        self.warmup_epochs
    }

    pub fn total_epochs(&self) -> usize {
        self.total_epochs
    }
}
