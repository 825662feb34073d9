//! Epoch-end hooks: checkpointing, early stopping, learning-rate logging.

use crate::config::MonitorMode;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::ExperimentLayout;
use poster_abstraction::Classifier;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// State handed to callbacks after each validation pass.
pub struct CallbackContext<'a> {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    pub max_epochs: usize,
    pub global_step: usize,
    pub lr: f64,
    /// Every value logged for this epoch (`train_*`, `val_*`); callbacks may add their own.
    pub metrics: &'a mut BTreeMap<String, f64>,
    pub model: &'a dyn Classifier,
}

impl CallbackContext<'_> {
    pub fn metric(&self, name: &str) -> TrainingResult<f64> {
        self.metrics.get(name).copied().ok_or_else(|| {
            TrainingError::Trainer(format!(
                "monitored metric `{name}` was not logged (available: {})",
                self.metrics.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

pub trait TrainerCallback: Send {
    fn on_epoch_end(&mut self, _ctx: &mut CallbackContext<'_>) -> TrainingResult<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str;
}

/// Keeps a single checkpoint: the best epoch so far on `monitor`.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    layout: ExperimentLayout,
    monitor: String,
    mode: MonitorMode,
    best: Option<(f64, PathBuf)>,
}

impl ModelCheckpoint {
    #[must_use]
    pub fn new(layout: ExperimentLayout, monitor: impl Into<String>, mode: MonitorMode) -> Self {
        Self { layout, monitor: monitor.into(), mode, best: None }
    }

    #[must_use]
    pub fn best_model_path(&self) -> Option<&Path> {
        self.best.as_ref().map(|(_, path)| path.as_path())
    }

    #[must_use]
    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|(score, _)| *score)
    }
}

impl TrainerCallback for ModelCheckpoint {
    fn on_epoch_end(&mut self, ctx: &mut CallbackContext<'_>) -> TrainingResult<CallbackAction> {
        let score = ctx.metric(&self.monitor)?;
        let best = self.best_score().unwrap_or_else(|| self.mode.worst());
        if !self.mode.improves(score, best, 0.0) {
            return Ok(CallbackAction::Continue);
        }

        let path = self.layout.checkpoint_path(ctx.epoch, &self.monitor, score);
        ctx.model.save(&path)?;
        info!(epoch = ctx.epoch, monitor = %self.monitor, score, path = %path.display(), "saved checkpoint");

        if let Some((_, previous)) = self.best.replace((score, path)) {
            if let Err(e) = std::fs::remove_file(&previous) {
                warn!(path = %previous.display(), error = %e, "failed to remove superseded checkpoint");
            }
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }
}

/// Stops training after `patience` epochs without improvement on `monitor`.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: String,
    mode: MonitorMode,
    patience: usize,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    #[must_use]
    pub fn new(monitor: impl Into<String>, mode: MonitorMode, patience: usize) -> Self {
        Self { monitor: monitor.into(), mode, patience, best: mode.worst(), wait: 0 }
    }
}

impl TrainerCallback for EarlyStopping {
    fn on_epoch_end(&mut self, ctx: &mut CallbackContext<'_>) -> TrainingResult<CallbackAction> {
        let score = ctx.metric(&self.monitor)?;
        if self.mode.improves(score, self.best, 0.0) {
            self.best = score;
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        debug!(monitor = %self.monitor, wait = self.wait, patience = self.patience, "no improvement");
        if self.wait >= self.patience {
            info!(
                monitor = %self.monitor,
                best = self.best,
                "Early stopping: no improvement for {} epochs",
                self.patience
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}

/// Logs the epoch's learning rate under `lr-{optimizer}`.
///
/// Runs before the other callbacks so they can monitor the rate.
#[derive(Debug, Clone)]
pub struct LearningRateMonitor {
    key: String,
}

impl LearningRateMonitor {
    #[must_use]
    pub fn new(optimizer: &str) -> Self {
        Self { key: format!("lr-{optimizer}") }
    }
}

impl TrainerCallback for LearningRateMonitor {
    fn on_epoch_end(&mut self, ctx: &mut CallbackContext<'_>) -> TrainingResult<CallbackAction> {
        ctx.metrics.insert(self.key.clone(), ctx.lr);
        debug!(epoch = ctx.epoch, key = %self.key, lr = ctx.lr, "learning rate");
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "LearningRateMonitor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearClassifier;
    use crate::optim::OptimizerSettings;
    use tempfile::TempDir;

    fn model() -> LinearClassifier {
        LinearClassifier::new(2, 1, OptimizerSettings::Sgd { lr: 0.1, momentum: 0.0, weight_decay: 0.0 })
    }

    fn step(cb: &mut dyn TrainerCallback, model: &LinearClassifier, epoch: usize, score: f64) -> CallbackAction {
        let mut metrics = BTreeMap::from([("val_f1".to_string(), score)]);
        let mut ctx =
            CallbackContext { epoch, max_epochs: 10, global_step: epoch * 5, lr: 0.1, metrics: &mut metrics, model };
        cb.on_epoch_end(&mut ctx).unwrap()
    }

    #[test]
    fn test_checkpoint_keeps_only_best() {
        let temp = TempDir::new().unwrap();
        let layout = ExperimentLayout::new(temp.path(), "exp");
        layout.ensure_dirs().unwrap();
        let model = model();
        let mut ckpt = ModelCheckpoint::new(layout, "val_f1", MonitorMode::Max);

        step(&mut ckpt, &model, 0, 0.4);
        step(&mut ckpt, &model, 1, 0.6);
        step(&mut ckpt, &model, 2, 0.5);

        let best = ckpt.best_model_path().unwrap().to_path_buf();
        assert_eq!(best.file_name().unwrap(), "epoch_epoch=01-val_f1=0.600.ckpt");
        let files: Vec<_> = std::fs::read_dir(temp.path().join("exp")).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(ckpt.best_score(), Some(0.6));
    }

    #[test]
    fn test_early_stopping_waits_for_patience() {
        let model = model();
        let mut es = EarlyStopping::new("val_f1", MonitorMode::Max, 2);
        assert_eq!(step(&mut es, &model, 0, 0.5), CallbackAction::Continue);
        assert_eq!(step(&mut es, &model, 1, 0.5), CallbackAction::Continue);
        assert_eq!(step(&mut es, &model, 2, 0.7), CallbackAction::Continue);
        assert_eq!(step(&mut es, &model, 3, 0.6), CallbackAction::Continue);
        assert_eq!(step(&mut es, &model, 4, 0.6), CallbackAction::Stop);
    }

    #[test]
    fn test_missing_metric_is_an_error() {
        let model = model();
        let mut metrics = BTreeMap::from([("val_loss".to_string(), 1.0)]);
        let mut ctx =
            CallbackContext { epoch: 0, max_epochs: 1, global_step: 0, lr: 0.1, metrics: &mut metrics, model: &model };
        let err = EarlyStopping::new("val_f1", MonitorMode::Max, 1).on_epoch_end(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("val_loss"));
    }

    #[test]
    fn test_lr_monitor_logs_the_rate() {
        let model = model();
        let mut metrics = BTreeMap::from([("val_f1".to_string(), 0.5)]);
        let mut ctx =
            CallbackContext { epoch: 2, max_epochs: 5, global_step: 10, lr: 0.025, metrics: &mut metrics, model: &model };
        let action = LearningRateMonitor::new("adamw").on_epoch_end(&mut ctx).unwrap();

        assert_eq!(action, CallbackAction::Continue);
        assert_eq!(metrics.get("lr-adamw"), Some(&0.025));
        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_lr_key_is_monitorable_by_later_callbacks() {
        let model = model();
        let mut monitor = LearningRateMonitor::new("sgd");
        let mut stopper = EarlyStopping::new("lr-sgd", MonitorMode::Max, 1);
        let mut metrics = BTreeMap::new();
        for epoch in 0..2 {
            let mut ctx =
                CallbackContext { epoch, max_epochs: 5, global_step: epoch, lr: 0.1, metrics: &mut metrics, model: &model };
            monitor.on_epoch_end(&mut ctx).unwrap();
            let action = stopper.on_epoch_end(&mut ctx).unwrap();
            assert_eq!(action, if epoch == 0 { CallbackAction::Continue } else { CallbackAction::Stop });
        }
    }
}
