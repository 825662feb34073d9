//! Poster Training
//!
//! Multi-label poster classification pipeline:
//! - Annotation tables and iterative stratified train/valid/test splitting
//! - Idempotent split persistence next to the image folder
//! - Config loading and registry-resolved losses, optimisers, schedulers and models
//! - Image transforms, datasets and batch loading
//! - A `Trainer` that fits, checkpoints, early-stops and tests

pub mod annotations;
pub mod artifacts;
pub mod augment;
pub mod callbacks;
pub mod config;
pub mod dataset;
pub mod error;
pub mod job;
pub mod layout;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod optim;
pub mod prepare;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod splitter;
pub mod trainer;

pub use annotations::{
    compute_dataset_id, one_hot_encode, read_table, write_table, AnnotationRecord, AnnotationTable, DatasetId,
    RawAnnotation,
};
pub use artifacts::{ArtifactKind, EpochRecord, MetricsLog, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use augment::{get_transforms, Transform, TransformPipeline};
pub use callbacks::{CallbackAction, CallbackContext, EarlyStopping, LearningRateMonitor, ModelCheckpoint, TrainerCallback};
pub use config::{Config, DataConfig, Kwargs, LossConfig, MonitorMode};
pub use dataset::{Batch, DataLoader, PosterDataset};
pub use error::{TrainingError, TrainingResult};
pub use job::{TrainingJob, TrainingJobId};
pub use layout::{DataLayout, ExperimentLayout};
pub use losses::{CompositeLoss, LossFn, LossReport};
pub use metrics::{sigmoid, MultilabelMetrics};
pub use models::{LinearClassifier, ModelSettings};
pub use optim::{OptimizerSettings, OptimizerState};
pub use prepare::{
    missing_images, read_subset, read_subsets, scan_image_folder, split_and_save_datasets, subsets_exist,
    SplitOutcome,
};
pub use progress::{ProgressEvent, ProgressSink, TracingProgressSink};
pub use registry::{Registries, Registry};
pub use scheduler::{LrSchedule, SchedulerSettings};
pub use splitter::{stratify_subsets, IterativeStratifier, Subset, Subsets};
pub use trainer::{PosterTrainer, Trainer, TrainerStatus};
