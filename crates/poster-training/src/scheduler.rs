//! Per-epoch learning-rate schedules.

use crate::config::{Kwargs, MonitorMode};
use crate::error::{TrainingError, TrainingResult};
use crate::registry::{kwarg_f64, kwarg_mode, kwarg_usize, reject_unknown};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerSettings {
    Constant,
    Step { step_size: usize, gamma: f64 },
    Cosine { t_max: usize, eta_min: f64 },
    Exponential { gamma: f64 },
    ReduceOnPlateau { mode: MonitorMode, factor: f64, patience: usize, min_lr: f64, threshold: f64 },
}

fn decay_factor(name: &str, value: f64) -> TrainingResult<f64> {
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(TrainingError::InvalidConfig(format!("`{name}` must be in (0, 1], got {value}")))
    }
}

impl SchedulerSettings {
    pub fn constant_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &[])?;
        Ok(Self::Constant)
    }

    pub fn step_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["step_size", "gamma"])?;
        let step_size = kwarg_usize(kwargs, &["step_size"], 0)?;
        if step_size == 0 {
            return Err(TrainingError::InvalidConfig("`step_size` is required and must be >= 1".to_string()));
        }
        Ok(Self::Step { step_size, gamma: decay_factor("gamma", kwarg_f64(kwargs, &["gamma"], 0.1)?)? })
    }

    pub fn cosine_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["t_max", "T_max", "eta_min"])?;
        let t_max = kwarg_usize(kwargs, &["t_max", "T_max"], 0)?;
        if t_max == 0 {
            return Err(TrainingError::InvalidConfig("`t_max` is required and must be >= 1".to_string()));
        }
        let eta_min = kwarg_f64(kwargs, &["eta_min"], 0.0)?;
        if eta_min < 0.0 {
            return Err(TrainingError::InvalidConfig("`eta_min` must be >= 0".to_string()));
        }
        Ok(Self::Cosine { t_max, eta_min })
    }

    pub fn exponential_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["gamma"])?;
        let gamma = kwarg_f64(kwargs, &["gamma"], f64::NAN)?;
        Ok(Self::Exponential { gamma: decay_factor("gamma", gamma)? })
    }

    pub fn plateau_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["mode", "factor", "patience", "min_lr", "threshold"])?;
        let factor = kwarg_f64(kwargs, &["factor"], 0.1)?;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(TrainingError::InvalidConfig(format!("`factor` must be in (0, 1), got {factor}")));
        }
        Ok(Self::ReduceOnPlateau {
            mode: kwarg_mode(kwargs, MonitorMode::Min)?,
            factor,
            patience: kwarg_usize(kwargs, &["patience"], 10)?,
            min_lr: kwarg_f64(kwargs, &["min_lr"], 0.0)?,
            threshold: kwarg_f64(kwargs, &["threshold"], 1e-4)?,
        })
    }
}

/// Learning rate as a function of completed epochs.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    settings: SchedulerSettings,
    base_lr: f64,
    epoch: usize,
    lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl LrSchedule {
    #[must_use]
    pub fn new(settings: SchedulerSettings, base_lr: f64) -> Self {
        let best = match &settings {
            SchedulerSettings::ReduceOnPlateau { mode, .. } => mode.worst(),
            _ => f64::NAN,
        };
        Self { settings, base_lr, epoch: 0, lr: base_lr, best, bad_epochs: 0 }
    }

    #[must_use]
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Advance one epoch. Plateau schedules need `monitored`; others ignore it.
    pub fn step(&mut self, monitored: Option<f64>) -> TrainingResult<()> {
        self.epoch += 1;
        let epoch = self.epoch as f64;
        self.lr = match self.settings {
            SchedulerSettings::Constant => self.base_lr,
            SchedulerSettings::Step { step_size, gamma } => {
                self.base_lr * gamma.powi(i32::try_from(self.epoch / step_size).unwrap_or(i32::MAX))
            }
            SchedulerSettings::Cosine { t_max, eta_min } => {
                let phase = std::f64::consts::PI * epoch / t_max as f64;
                eta_min + (self.base_lr - eta_min) * (1.0 + phase.cos()) / 2.0
            }
            SchedulerSettings::Exponential { gamma } => self.base_lr * gamma.powf(epoch),
            SchedulerSettings::ReduceOnPlateau { mode, factor, patience, min_lr, threshold } => {
                let value = monitored.ok_or_else(|| {
                    TrainingError::Trainer("reduce_on_plateau needs the monitored metric".to_string())
                })?;
                let min_delta = if self.best.is_finite() { self.best.abs() * threshold } else { 0.0 };
                if mode.improves(value, self.best, min_delta) {
                    self.best = value;
                    self.bad_epochs = 0;
                    self.lr
                } else {
                    self.bad_epochs += 1;
                    if self.bad_epochs > patience {
                        self.bad_epochs = 0;
                        (self.lr * factor).max(min_lr)
                    } else {
                        self.lr
                    }
                }
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> Kwargs {
        value.as_object().cloned().unwrap()
    }

    fn run(settings: SchedulerSettings, base: f64, epochs: usize) -> Vec<f64> {
        let mut schedule = LrSchedule::new(settings, base);
        (0..epochs)
            .map(|_| {
                schedule.step(None).unwrap();
                schedule.lr()
            })
            .collect()
    }

    #[test]
    fn test_step_schedule() {
        let settings = SchedulerSettings::step_from_kwargs(&kwargs(json!({"step_size": 2, "gamma": 0.5}))).unwrap();
        let lrs = run(settings, 1.0, 4);
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn test_cosine_reaches_eta_min() {
        let settings = SchedulerSettings::cosine_from_kwargs(&kwargs(json!({"T_max": 4, "eta_min": 0.1}))).unwrap();
        let lrs = run(settings, 1.0, 4);
        assert!((lrs[1] - 0.55).abs() < 1e-12);
        assert!((lrs[3] - 0.1).abs() < 1e-12);
        assert!(lrs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_exponential_and_constant() {
        let settings = SchedulerSettings::exponential_from_kwargs(&kwargs(json!({"gamma": 0.5}))).unwrap();
        assert_eq!(run(settings, 2.0, 2), vec![1.0, 0.5]);
        assert_eq!(run(SchedulerSettings::Constant, 0.3, 2), vec![0.3, 0.3]);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let settings =
            SchedulerSettings::plateau_from_kwargs(&kwargs(json!({"mode": "max", "factor": 0.5, "patience": 1})))
                .unwrap();
        let mut schedule = LrSchedule::new(settings, 1.0);
        for (score, expected) in [(0.5, 1.0), (0.4, 1.0), (0.4, 0.5), (0.6, 0.5)] {
            schedule.step(Some(score)).unwrap();
            assert!((schedule.lr() - expected).abs() < 1e-12, "score {score}");
        }
        assert!(schedule.step(None).is_err());
    }

    #[test]
    fn test_required_arguments() {
        assert!(SchedulerSettings::step_from_kwargs(&Kwargs::new()).is_err());
        assert!(SchedulerSettings::cosine_from_kwargs(&Kwargs::new()).is_err());
        assert!(SchedulerSettings::exponential_from_kwargs(&Kwargs::new()).is_err());
        assert!(SchedulerSettings::constant_from_kwargs(&kwargs(json!({"gamma": 1}))).is_err());
    }
}
