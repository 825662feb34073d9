//! Multi-label losses over raw logits, and their weighted combination.

use crate::config::{Kwargs, LossConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::registry::{kwarg_f64, reject_unknown, Registry};
use std::collections::BTreeMap;

/// A per-sample multi-label loss.
///
/// `value_and_grad` returns the loss averaged over classes together with its
/// gradient with respect to each logit.
pub trait LossFn: Send + Sync + std::fmt::Debug {
    fn value_and_grad(&self, logits: &[f32], targets: &[f32]) -> (f64, Vec<f32>);
}

/// `ln(1 + e^x)` without overflow.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Scalar or per-class float argument, broadcast on use.
fn kwarg_per_class(kwargs: &Kwargs, name: &str) -> TrainingResult<Option<Vec<f32>>> {
    let Some(value) = kwargs.get(name) else {
        return Ok(None);
    };
    let invalid = || TrainingError::InvalidConfig(format!("`{name}` must be a number or a list of numbers"));
    if let Some(v) = value.as_f64() {
        return Ok(Some(vec![v as f32]));
    }
    let items = value.as_array().ok_or_else(invalid)?;
    items.iter().map(|v| v.as_f64().map(|f| f as f32).ok_or_else(invalid)).collect::<TrainingResult<Vec<_>>>().map(Some)
}

fn broadcast(values: &[f32], class: usize) -> f64 {
    match values {
        [] => 1.0,
        [single] => f64::from(*single),
        many => many.get(class).copied().map_or(1.0, f64::from),
    }
}

/// Binary cross-entropy on logits with an optional positive-class weight.
#[derive(Debug, Clone, Default)]
pub struct BceWithLogits {
    pos_weight: Vec<f32>,
}

impl BceWithLogits {
    pub fn from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["pos_weight"])?;
        Ok(Self { pos_weight: kwarg_per_class(kwargs, "pos_weight")?.unwrap_or_default() })
    }
}

impl LossFn for BceWithLogits {
    fn value_and_grad(&self, logits: &[f32], targets: &[f32]) -> (f64, Vec<f32>) {
        let n = logits.len().max(1) as f64;
        let mut total = 0.0;
        let mut grad = Vec::with_capacity(logits.len());
        for (class, (&z, &y)) in logits.iter().zip(targets).enumerate() {
            let (z, y) = (f64::from(z), f64::from(y));
            let p = broadcast(&self.pos_weight, class);
            total += p * y * softplus(-z) + (1.0 - y) * softplus(z);
            grad.push(((sigmoid(z) * (p * y + 1.0 - y) - p * y) / n) as f32);
        }
        (total / n, grad)
    }
}

/// Logistic loss per class with optional class weights, averaged over classes.
#[derive(Debug, Clone, Default)]
pub struct SoftMarginLoss {
    weight: Vec<f32>,
}

impl SoftMarginLoss {
    pub fn from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["weight"])?;
        Ok(Self { weight: kwarg_per_class(kwargs, "weight")?.unwrap_or_default() })
    }
}

impl LossFn for SoftMarginLoss {
    fn value_and_grad(&self, logits: &[f32], targets: &[f32]) -> (f64, Vec<f32>) {
        let n = logits.len().max(1) as f64;
        let mut total = 0.0;
        let mut grad = Vec::with_capacity(logits.len());
        for (class, (&z, &y)) in logits.iter().zip(targets).enumerate() {
            let (z, y) = (f64::from(z), f64::from(y));
            let w = broadcast(&self.weight, class);
            total += w * (y * softplus(-z) + (1.0 - y) * softplus(z));
            grad.push((w * (sigmoid(z) - y) / n) as f32);
        }
        (total / n, grad)
    }
}

/// Sigmoid focal loss. A negative `alpha` disables class balancing.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    gamma: f64,
    alpha: f64,
}

impl Default for FocalLoss {
    fn default() -> Self {
        Self { gamma: 2.0, alpha: 0.25 }
    }
}

impl FocalLoss {
    pub fn from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["gamma", "alpha"])?;
        let defaults = Self::default();
        let gamma = kwarg_f64(kwargs, &["gamma"], defaults.gamma)?;
        if gamma < 0.0 {
            return Err(TrainingError::InvalidConfig("`gamma` must be >= 0".to_string()));
        }
        let alpha = kwarg_f64(kwargs, &["alpha"], defaults.alpha)?;
        if alpha > 1.0 {
            return Err(TrainingError::InvalidConfig("`alpha` must be <= 1".to_string()));
        }
        Ok(Self { gamma, alpha })
    }
}

impl LossFn for FocalLoss {
    fn value_and_grad(&self, logits: &[f32], targets: &[f32]) -> (f64, Vec<f32>) {
        let n = logits.len().max(1) as f64;
        let mut total = 0.0;
        let mut grad = Vec::with_capacity(logits.len());
        for (&z, &y) in logits.iter().zip(targets) {
            let (z, y) = (f64::from(z), f64::from(y));
            let p = sigmoid(z);
            let pt = p * y + (1.0 - p) * (1.0 - y);
            let alpha_t = if self.alpha >= 0.0 { self.alpha * y + (1.0 - self.alpha) * (1.0 - y) } else { 1.0 };
            let ce = y * softplus(-z) + (1.0 - y) * softplus(z);
            let modulator = (1.0 - pt).powf(self.gamma);
            total += alpha_t * modulator * ce;

            // d(pt)/dz = sign * pt * (1 - pt), with sign = 2y - 1, so
            // d(1 - pt)^gamma / dz = -gamma * (1 - pt)^gamma * sign * pt
            let sign = 2.0 * y - 1.0;
            let d_ce = p - y;
            let d_mod = -self.gamma * modulator * sign * pt;
            grad.push((alpha_t * (d_mod * ce + modulator * d_ce) / n) as f32);
        }
        (total / n, grad)
    }
}

#[derive(Debug)]
pub struct WeightedLoss {
    pub name: String,
    pub weight: f64,
    pub loss: Box<dyn LossFn>,
}

/// Loss values for one batch, averaged over its samples.
#[derive(Debug, Clone)]
pub struct LossReport {
    pub components: Vec<(String, f64)>,
    pub total: f64,
    /// Gradient of `total` with respect to each sample's logits.
    pub grads: Vec<Vec<f32>>,
}

impl LossReport {
    /// `{prefix}{name}_loss` per component, then `{prefix}total_loss`.
    #[must_use]
    pub fn log_entries(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> =
            self.components.iter().map(|(name, value)| (format!("{prefix}{name}_loss"), *value)).collect();
        entries.push((format!("{prefix}total_loss"), self.total));
        entries
    }
}

/// Weighted sum of named losses.
#[derive(Debug)]
pub struct CompositeLoss {
    losses: Vec<WeightedLoss>,
}

impl CompositeLoss {
    pub fn new(losses: Vec<WeightedLoss>) -> TrainingResult<Self> {
        if losses.is_empty() {
            return Err(TrainingError::InvalidConfig("at least one loss is required".to_string()));
        }
        Ok(Self { losses })
    }

    pub fn from_config(configs: &[LossConfig], registry: &Registry<Box<dyn LossFn>>) -> TrainingResult<Self> {
        let losses = configs
            .iter()
            .map(|c| {
                Ok(WeightedLoss {
                    name: c.name.clone(),
                    weight: c.weight,
                    loss: registry.build(&c.loss_fn, &c.loss_kwargs)?,
                })
            })
            .collect::<TrainingResult<Vec<_>>>()?;
        Self::new(losses)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.losses.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn evaluate(&self, logits: &[Vec<f32>], targets: &[Vec<f32>]) -> TrainingResult<LossReport> {
        if logits.len() != targets.len() || logits.is_empty() {
            return Err(TrainingError::Trainer(format!(
                "loss needs matching non-empty batches (logits {}, targets {})",
                logits.len(),
                targets.len()
            )));
        }
        let batch = logits.len() as f64;
        let mut components = Vec::with_capacity(self.losses.len());
        let mut grads: Vec<Vec<f32>> = logits.iter().map(|l| vec![0.0; l.len()]).collect();
        let mut total = 0.0;

        for weighted in &self.losses {
            let mut sum = 0.0;
            for ((sample_logits, sample_targets), sample_grad) in logits.iter().zip(targets).zip(&mut grads) {
                if sample_logits.len() != sample_targets.len() {
                    return Err(TrainingError::Trainer(format!(
                        "logit width {} does not match target width {}",
                        sample_logits.len(),
                        sample_targets.len()
                    )));
                }
                let (value, grad) = weighted.loss.value_and_grad(sample_logits, sample_targets);
                sum += value;
                let scale = (weighted.weight / batch) as f32;
                for (acc, g) in sample_grad.iter_mut().zip(grad) {
                    *acc += scale * g;
                }
            }
            let mean = sum / batch;
            total += weighted.weight * mean;
            components.push((weighted.name.clone(), mean));
        }

        Ok(LossReport { components, total, grads })
    }
}

/// Sample-weighted running means of loss entries over an epoch.
#[derive(Debug, Default, Clone)]
pub struct LossAccumulator {
    sums: BTreeMap<String, f64>,
    samples: usize,
}

impl LossAccumulator {
    pub fn update(&mut self, report: &LossReport, prefix: &str, batch_size: usize) {
        for (key, value) in report.log_entries(prefix) {
            *self.sums.entry(key).or_default() += value * batch_size as f64;
        }
        self.samples += batch_size;
    }

    #[must_use]
    pub fn compute(&self) -> BTreeMap<String, f64> {
        if self.samples == 0 {
            return BTreeMap::new();
        }
        self.sums.iter().map(|(k, v)| (k.clone(), v / self.samples as f64)).collect()
    }
}
