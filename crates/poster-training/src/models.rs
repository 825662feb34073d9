//! Built-in classifier backends.
//!
//! `linear` is a small baseline: each RGB plane is average-pooled to a
//! `pool x pool` grid and a single affine layer maps those features to one
//! logit per tag. It exists so the whole pipeline runs end to end without a
//! deep-learning runtime; heavier backends plug in through
//! [`poster_abstraction::Classifier`].

use crate::config::Kwargs;
use crate::error::{TrainingError, TrainingResult};
use crate::optim::{OptimizerSettings, OptimizerState};
use crate::registry::{kwarg_usize, reject_unknown};
use poster_abstraction::{BackendError, Classifier, ImageTensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSettings {
    Linear { pool: usize },
}

impl ModelSettings {
    pub fn linear_from_kwargs(kwargs: &Kwargs) -> TrainingResult<Self> {
        reject_unknown(kwargs, &["model_name", "pool", "pretrained"])?;
        let pool = kwarg_usize(kwargs, &["pool"], 8)?;
        if pool == 0 {
            return Err(TrainingError::InvalidConfig("`pool` must be >= 1".to_string()));
        }
        Ok(Self::Linear { pool })
    }

    #[must_use]
    pub fn build(&self, num_classes: usize, optimizer: OptimizerSettings) -> Box<dyn Classifier> {
        match self {
            Self::Linear { pool } => Box::new(LinearClassifier::new(num_classes, *pool, optimizer)),
        }
    }
}

const IN_CHANNELS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearCheckpoint {
    model_id: String,
    num_classes: usize,
    pool: usize,
    params: Vec<f32>,
    optimizer: OptimizerState,
}

/// Pooled-pixel logistic regression over all tags.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    num_classes: usize,
    pool: usize,
    /// `num_classes` weight rows of `feature_len()` values, then `num_classes` biases.
    params: Vec<f32>,
    optimizer: OptimizerState,
}

impl LinearClassifier {
    #[must_use]
    pub fn new(num_classes: usize, pool: usize, optimizer: OptimizerSettings) -> Self {
        let num_params = num_classes * (IN_CHANNELS * pool * pool + 1);
        Self {
            num_classes,
            pool,
            params: vec![0.0; num_params],
            optimizer: OptimizerState::new(optimizer, num_params),
        }
    }

    fn feature_len(&self) -> usize {
        IN_CHANNELS * self.pool * self.pool
    }

    /// Adaptive average pooling of each plane into `pool x pool` cells.
    fn features(&self, image: &ImageTensor) -> Result<Vec<f32>, BackendError> {
        if image.channels != IN_CHANNELS || image.height == 0 || image.width == 0 {
            return Err(BackendError::ShapeMismatch(format!(
                "linear model expects {IN_CHANNELS} non-empty channels, got {}x{}x{}",
                image.channels, image.height, image.width
            )));
        }
        let cell_bounds = |i: usize, extent: usize| {
            let start = i * extent / self.pool;
            let end = ((i + 1) * extent).div_ceil(self.pool).max(start + 1).min(extent);
            (start.min(extent - 1), end)
        };

        let mut features = Vec::with_capacity(self.feature_len());
        for channel in 0..IN_CHANNELS {
            let plane = image.plane(channel);
            for gy in 0..self.pool {
                let (y0, y1) = cell_bounds(gy, image.height);
                for gx in 0..self.pool {
                    let (x0, x1) = cell_bounds(gx, image.width);
                    let mut sum = 0.0_f32;
                    for y in y0..y1 {
                        sum += plane[y * image.width + x0..y * image.width + x1].iter().sum::<f32>();
                    }
                    features.push(sum / ((y1 - y0) * (x1 - x0)) as f32);
                }
            }
        }
        Ok(features)
    }

    fn logits(&self, features: &[f32]) -> Vec<f32> {
        let d = self.feature_len();
        let (weights, biases) = self.params.split_at(self.num_classes * d);
        weights
            .chunks_exact(d)
            .zip(biases)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }
}

impl Classifier for LinearClassifier {
    fn model_id(&self) -> &str {
        "linear"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, images: &[ImageTensor]) -> Result<Vec<Vec<f32>>, BackendError> {
        images.iter().map(|image| Ok(self.logits(&self.features(image)?))).collect()
    }

    fn backward(
        &mut self,
        images: &[ImageTensor],
        grad_logits: &[Vec<f32>],
        learning_rate: f64,
    ) -> Result<(), BackendError> {
        if images.len() != grad_logits.len() {
            return Err(BackendError::ShapeMismatch(format!(
                "{} images but {} gradient rows",
                images.len(),
                grad_logits.len()
            )));
        }
        let d = self.feature_len();
        let mut grads = vec![0.0_f32; self.params.len()];
        for (image, grad) in images.iter().zip(grad_logits) {
            if grad.len() != self.num_classes {
                return Err(BackendError::ShapeMismatch(format!(
                    "expected {} logit gradients, got {}",
                    self.num_classes,
                    grad.len()
                )));
            }
            let features = self.features(image)?;
            let (weight_grads, bias_grads) = grads.split_at_mut(self.num_classes * d);
            for ((row, b), &g) in weight_grads.chunks_exact_mut(d).zip(bias_grads.iter_mut()).zip(grad) {
                for (w, x) in row.iter_mut().zip(&features) {
                    *w += g * x;
                }
                *b += g;
            }
        }
        self.optimizer
            .step(&mut self.params, &grads, learning_rate)
            .map_err(|e| BackendError::Other(e.to_string()))
    }

    fn save(&self, path: &Path) -> Result<(), BackendError> {
        let checkpoint = LinearCheckpoint {
            model_id: self.model_id().to_string(),
            num_classes: self.num_classes,
            pool: self.pool,
            params: self.params.clone(),
            optimizer: self.optimizer.clone(),
        };
        let json = serde_json::to_vec(&checkpoint).map_err(|e| BackendError::Checkpoint(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| BackendError::Checkpoint(format!("failed to write {}: {e}", path.display())))
    }

    fn load(&mut self, path: &Path) -> Result<(), BackendError> {
        let bytes = std::fs::read(path)
            .map_err(|e| BackendError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
        let checkpoint: LinearCheckpoint =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Checkpoint(e.to_string()))?;
        if checkpoint.model_id != self.model_id()
            || checkpoint.num_classes != self.num_classes
            || checkpoint.pool != self.pool
            || checkpoint.params.len() != self.params.len()
        {
            return Err(BackendError::Checkpoint(format!(
                "checkpoint {} is for {} with {} classes and pool {}, expected linear with {} classes and pool {}",
                path.display(),
                checkpoint.model_id,
                checkpoint.num_classes,
                checkpoint.pool,
                self.num_classes,
                self.pool
            )));
        }
        self.params = checkpoint.params;
        self.optimizer = checkpoint.optimizer;
        Ok(())
    }
}
