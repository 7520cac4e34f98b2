//! End-of-epoch policies: checkpointing, learning rate reduction and early
//! stopping. All of them minimize the monitored loss.

use crate::{
    common::*,
    config::{CheckpointConfig, EarlyStoppingConfig, ReduceLrConfig},
};

/// Losses of a finished epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    /// `None` when there is no validation split.
    pub val_loss: Option<f64>,
}

impl EpochMetrics {
    /// The validation loss, or the training loss without validation.
    pub fn monitored(&self) -> f64 {
        self.val_loss.unwrap_or(self.loss)
    }

    /// The file name of a checkpoint taken after this epoch. Epochs are
    /// counted from one.
    pub fn checkpoint_file_name(&self) -> String {
        format!(
            "ep{:03}-loss{:.3}-val_loss{:.3}.ckpt",
            self.epoch + 1,
            self.loss,
            self.monitored()
        )
    }
}

/// Decides after which epochs the weights are saved.
///
/// The state lives across stages, so a later stage only saves weights that
/// beat every earlier checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    period: usize,
    save_best_only: bool,
    best: f64,
    epochs_since_last_save: usize,
}

impl CheckpointPolicy {
    pub fn new(config: &CheckpointConfig) -> Self {
        Self {
            period: config.period.max(1),
            save_best_only: config.save_best_only,
            best: f64::INFINITY,
            epochs_since_last_save: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Returns the checkpoint file name if the weights should be saved.
    pub fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> Option<String> {
        self.epochs_since_last_save += 1;
        if self.epochs_since_last_save < self.period {
            return None;
        }
        self.epochs_since_last_save = 0;

        if self.save_best_only {
            let current = metrics.monitored();
            if current >= self.best {
                debug!(
                    "epoch {}: loss {:.5} did not improve from {:.5}",
                    metrics.epoch + 1,
                    current,
                    self.best
                );
                return None;
            }
            info!(
                "epoch {}: loss improved from {:.5} to {:.5}",
                metrics.epoch + 1,
                self.best,
                current
            );
            self.best = current;
        }

        Some(metrics.checkpoint_file_name())
    }
}

/// Multiplies the learning rate by `factor` once the monitored loss stops
/// improving for `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_delta: f64,
    cooldown: usize,
    min_lr: f64,
    best: f64,
    wait: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: &ReduceLrConfig) -> Self {
        Self {
            factor: config.factor.raw(),
            patience: config.patience,
            min_delta: config.min_delta.raw(),
            cooldown: config.cooldown,
            min_lr: config.min_lr.raw(),
            best: f64::INFINITY,
            wait: 0,
            cooldown_counter: 0,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    /// Returns the new learning rate if it is lowered.
    pub fn on_epoch_end(&mut self, monitored: f64, lr: f64) -> Option<f64> {
        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if monitored < self.best - self.min_delta {
            self.best = monitored;
            self.wait = 0;
            return None;
        }
        if self.in_cooldown() {
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience || lr <= self.min_lr {
            return None;
        }

        let new_lr = (lr * self.factor).max(self.min_lr);
        self.cooldown_counter = self.cooldown;
        self.wait = 0;
        Some(new_lr)
    }
}

/// Stops a stage once the monitored loss stops improving for `patience`
/// epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            min_delta: config.min_delta.raw(),
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Returns true if training should stop.
    pub fn on_epoch_end(&mut self, monitored: f64) -> bool {
        if monitored < self.best - self.min_delta {
            self.best = monitored;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }
}
