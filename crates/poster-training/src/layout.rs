use crate::error::TrainingResult;
use crate::splitter::Subset;
use std::path::{Path, PathBuf};

/// Filesystem layout of a data directory.
///
/// ```text
/// <data_path>/train_classes.csv      raw annotations (image_name, tags)
/// <data_path>/train-jpg/<name>.jpg   images
/// <data_path>/df_{train,valid,test}.csv
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn raw_annotations_path(&self) -> PathBuf {
        self.root.join("train_classes.csv")
    }

    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("train-jpg")
    }

    #[must_use]
    pub fn subset_path(&self, subset: Subset) -> PathBuf {
        self.root.join(format!("df_{}.csv", subset.as_str()))
    }

    #[must_use]
    pub fn split_lock_path(&self) -> PathBuf {
        self.root.join(".split.lock")
    }
}

/// Filesystem layout for one experiment's outputs.
///
/// Default layout is `<experiments_dir>/<experiment_name>/...`
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    #[must_use]
    pub fn new(experiments_dir: &Path, experiment_name: &str) -> Self {
        Self { root: experiments_dir.join(experiment_name) }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("training_manifest.json")
    }

    #[must_use]
    pub fn metrics_log_path(&self) -> PathBuf {
        self.root.join("metrics.jsonl")
    }

    #[must_use]
    pub fn config_snapshot_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Checkpoint file name for `epoch` scored `value` on `monitor`.
    ///
    /// Every field is written as `name=value` after the `epoch_` prefix, so
    /// epoch 3 at 0.712 `val_f1` becomes `epoch_epoch=03-val_f1=0.712.ckpt`.
    #[must_use]
    pub fn checkpoint_path(&self, epoch: usize, monitor: &str, value: f64) -> PathBuf {
        self.root.join(format!("epoch_epoch={epoch:02}-{monitor}={value:.3}.ckpt"))
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
