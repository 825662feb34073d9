//! First-order optimisers over a flat parameter vector.

use crate::config::Kwargs;
use crate::error::{TrainingError, TrainingResult};
use crate::registry::{kwarg_f64, reject_unknown};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSettings {
    Sgd {
        lr: f64,
        momentum: f64,
        weight_decay: f64,
    },
    /// Adam; `decoupled` selects AdamW-style weight decay.
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
        decoupled: bool,
    },
}

fn check_range(name: &str, value: f64, lo: f64, hi: f64) -> TrainingResult<f64> {
    if (lo..hi).contains(&value) {
        Ok(value)
    } else {
        Err(TrainingError::InvalidConfig(format!("`{name}` must be in [{lo}, {hi}), got {value}")))
    }
}

impl OptimizerSettings {
    pub fn sgd_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["lr", "momentum", "weight_decay"])?;
        Ok(Self::Sgd {
            lr: positive_lr(kwarg_f64(kwargs, &["lr"], 0.01)?)?,
            momentum: check_range("momentum", kwarg_f64(kwargs, &["momentum"], 0.0)?, 0.0, 1.0)?,
            weight_decay: check_range("weight_decay", kwarg_f64(kwargs, &["weight_decay"], 0.0)?, 0.0, f64::MAX)?,
        })
    }

    pub fn adam_from_kwargs(kwargs: &Kwargs, decoupled: bool) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["lr", "betas", "eps", "weight_decay"])?;
        let (beta1, beta2) = match kwargs.get("betas") {
            None => (0.9, 0.999),
            Some(value) => match value.as_array().map(Vec::as_slice) {
                Some([b1, b2]) => match (b1.as_f64(), b2.as_f64()) {
                    (Some(b1), Some(b2)) => (b1, b2),
                    _ => return Err(TrainingError::InvalidConfig("`betas` must be two numbers".to_string())),
                },
                _ => return Err(TrainingError::InvalidConfig("`betas` must be a list of two numbers".to_string())),
            },
        };
        let default_decay = if decoupled { 0.01 } else { 0.0 };
        Ok(Self::Adam {
            lr: positive_lr(kwarg_f64(kwargs, &["lr"], 0.001)?)?,
            beta1: check_range("betas[0]", beta1, 0.0, 1.0)?,
            beta2: check_range("betas[1]", beta2, 0.0, 1.0)?,
            eps: check_range("eps", kwarg_f64(kwargs, &["eps"], 1e-8)?, 0.0, f64::MAX)?,
            weight_decay: check_range(
                "weight_decay",
                kwarg_f64(kwargs, &["weight_decay"], default_decay)?,
                0.0,
                f64::MAX,
            )?,
            decoupled,
        })
    }

    /// Initial learning rate, the scheduler's starting point.
    #[must_use]
    pub fn lr(&self) -> f64 {
        match self {
            Self::Sgd { lr, .. } | Self::Adam { lr, .. } => *lr,
        }
    }
}

fn positive_lr(lr: f64) -> TrainingResult<f64> {
    if lr > 0.0 {
        Ok(lr)
    } else {
        Err(TrainingError::InvalidConfig(format!("`lr` must be > 0, got {lr}")))
    }
}

/// Per-parameter optimiser state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    settings: OptimizerSettings,
    steps: u64,
    first: Vec<f32>,
    second: Vec<f32>,
}

impl OptimizerState {
    #[must_use]
    pub fn new(settings: OptimizerSettings, num_params: usize) -> Self {
        let second = match settings {
            OptimizerSettings::Sgd { .. } => Vec::new(),
            OptimizerSettings::Adam { .. } => vec![0.0; num_params],
        };
        Self { settings, steps: 0, first: vec![0.0; num_params], second }
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Apply one update at learning rate `lr`.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32], lr: f64) -> TrainingResult<()> {
        if params.len() != grads.len() || params.len() != self.first.len() {
            return Err(TrainingError::Trainer(format!(
                "optimizer state for {} parameters got {} params and {} grads",
                self.first.len(),
                params.len(),
                grads.len()
            )));
        }
        self.steps += 1;

        match self.settings {
            OptimizerSettings::Sgd { momentum, weight_decay, .. } => {
                for ((p, &g), v) in params.iter_mut().zip(grads).zip(&mut self.first) {
                    let g = f64::from(g) + weight_decay * f64::from(*p);
                    let update = if momentum > 0.0 {
                        let next = momentum * f64::from(*v) + g;
                        *v = next as f32;
                        next
                    } else {
                        g
                    };
                    *p = (f64::from(*p) - lr * update) as f32;
                }
            }
            OptimizerSettings::Adam { beta1, beta2, eps, weight_decay, decoupled, .. } => {
                let t = i32::try_from(self.steps).unwrap_or(i32::MAX);
                let bias1 = 1.0 - beta1.powi(t);
                let bias2 = 1.0 - beta2.powi(t);
                for (((p, &g), m), v) in params.iter_mut().zip(grads).zip(&mut self.first).zip(&mut self.second) {
                    let mut value = f64::from(*p);
                    let mut g = f64::from(g);
                    if decoupled {
                        value -= lr * weight_decay * value;
                    } else {
                        g += weight_decay * value;
                    }
                    let m_next = beta1 * f64::from(*m) + (1.0 - beta1) * g;
                    let v_next = beta2 * f64::from(*v) + (1.0 - beta2) * g * g;
                    *m = m_next as f32;
                    *v = v_next as f32;
                    value -= lr * (m_next / bias1) / ((v_next / bias2).sqrt() + eps);
                    *p = value as f32;
                }
            }
        }
        Ok(())
    }
}
