//! Backend abstraction layer for the poster pipeline.
//!
//! This module defines the narrow seams between the training orchestration and
//! whatever actually stores images or runs a model: a [`SampleSource`] that
//! yields `(image, labels)` pairs by index, and a [`Classifier`] that turns a
//! batch of images into per-tag logits and accepts gradients back.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Represents an error raised by a sample source or a classifier backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    /// A sample index was outside `0..len`.
    #[error("Sample index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of samples in the source.
        len: usize,
    },

    /// The sample could not be loaded (missing file, undecodable image, ...).
    #[error("Sample Load Error: {0}")]
    SampleLoad(String),

    /// Input tensors did not match the shape the backend expects.
    #[error("Shape Mismatch: {0}")]
    ShapeMismatch(String),

    /// Reading or writing model state failed.
    #[error("Checkpoint Error: {0}")]
    Checkpoint(String),

    /// Other unexpected errors.
    #[error("Other Backend Error: {0}")]
    Other(String),
}

/// A dense image in channel-first (CHW) layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTensor {
    /// Number of channels (3 for RGB).
    pub channels: usize,
    /// Height in pixels.
    pub height: usize,
    /// Width in pixels.
    pub width: usize,
    /// `channels * height * width` values, plane after plane.
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// Creates a tensor, checking that `data` matches the declared shape.
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self, BackendError> {
        let expected = channels * height * width;
        if data.len() != expected {
            return Err(BackendError::ShapeMismatch(format!(
                "expected {expected} values for {channels}x{height}x{width}, got {}",
                data.len()
            )));
        }
        Ok(Self { channels, height, width, data })
    }

    /// A zero-filled tensor of the given shape.
    #[must_use]
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width, data: vec![0.0; channels * height * width] }
    }

    /// Number of values in a single channel plane.
    #[must_use]
    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    /// Borrow one channel plane.
    #[must_use]
    pub fn plane(&self, channel: usize) -> &[f32] {
        let len = self.plane_len();
        &self.data[channel * len..(channel + 1) * len]
    }
}

/// One `(image, labels)` pair produced by a [`SampleSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// The (possibly augmented) image.
    pub image: ImageTensor,
    /// Multi-hot target vector, one entry per tag.
    pub labels: Vec<f32>,
}

/// Anything that can report a sample count and produce a sample by index.
///
/// Implementations must be `Send + Sync` so loaders can share them across threads.
pub trait SampleSource: Send + Sync {
    /// Number of samples available.
    fn len(&self) -> usize;

    /// Returns `true` when the source holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produces the sample at `index`.
    ///
    /// `epoch` lets randomized sources vary augmentations between passes while
    /// staying reproducible.
    ///
    /// # Errors
    /// Returns a `BackendError` if the index is out of range or loading fails.
    fn get(&self, index: usize, epoch: usize) -> Result<Sample, BackendError>;
}

/// A trainable multi-label classifier.
///
/// The orchestration computes losses and gradients with respect to the logits;
/// the backend owns its parameters and how gradients flow into them.
pub trait Classifier: Send {
    /// Returns the ID of the model.
    fn model_id(&self) -> &str;

    /// Number of output logits per image.
    fn num_classes(&self) -> usize;

    /// Computes raw logits for a batch of images.
    ///
    /// # Errors
    /// Returns a `BackendError` if an image has an unexpected shape.
    fn forward(&self, images: &[ImageTensor]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Applies one optimisation step given `d(loss)/d(logits)` for each image.
    ///
    /// # Errors
    /// Returns a `BackendError` if batch sizes or shapes disagree.
    fn backward(
        &mut self,
        images: &[ImageTensor],
        grad_logits: &[Vec<f32>],
        learning_rate: f64,
    ) -> Result<(), BackendError>;

    /// Persists the current parameters to `path`.
    ///
    /// # Errors
    /// Returns a `BackendError` if serialization or the write fails.
    fn save(&self, path: &Path) -> Result<(), BackendError>;

    /// Replaces the current parameters with those stored at `path`.
    ///
    /// # Errors
    /// Returns a `BackendError` if the file is missing or incompatible.
    fn load(&mut self, path: &Path) -> Result<(), BackendError>;
}
