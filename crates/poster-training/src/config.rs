//! Experiment configuration.
//!
//! One YAML (or TOML) file describes data, model, optimiser, scheduler and
//! losses. Object names such as `optimizer` or `loss_fn` are registry keys
//! resolved by [`crate::registry::Registries`].

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Free-form constructor arguments, as written in the config file.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    /// Whether `candidate` beats `best` by more than `min_delta`.
    #[must_use]
    pub fn improves(self, candidate: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Min => candidate < best - min_delta,
            Self::Max => candidate > best + min_delta,
        }
    }

    /// The value every real score improves on.
    #[must_use]
    pub fn worst(self) -> f64 {
        match self {
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    pub name: String,
    pub weight: f64,
    pub loss_fn: String,
    #[serde(default)]
    pub loss_kwargs: Kwargs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_path: PathBuf,
    pub batch_size: usize,
    #[serde(default)]
    pub n_workers: usize,
    pub train_size: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub project_name: String,
    pub experiment_name: String,
    pub data_config: DataConfig,
    pub n_epochs: usize,
    pub num_classes: usize,
    #[serde(default = "default_accelerator")]
    pub accelerator: String,
    #[serde(default)]
    pub device: usize,
    pub monitor_metric: String,
    pub monitor_mode: MonitorMode,
    #[serde(default)]
    pub model_kwargs: Kwargs,
    pub optimizer: String,
    #[serde(default)]
    pub optimizer_kwargs: Kwargs,
    pub scheduler: String,
    #[serde(default)]
    pub scheduler_kwargs: Kwargs,
    pub losses: Vec<LossConfig>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_experiments_dir")]
    pub experiments_dir: PathBuf,
}

fn default_accelerator() -> String {
    "cpu".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    50
}

fn default_patience() -> usize {
    4
}

fn default_experiments_dir() -> PathBuf {
    PathBuf::from("experiments")
}

impl Config {
    /// Load from YAML, or TOML when the file ends in `.toml`, then validate.
    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;

        let is_toml = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let config: Self = if is_toml {
            toml::from_str(&content)
                .map_err(|e| TrainingError::InvalidConfig(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| TrainingError::InvalidConfig(format!("{}: {e}", path.display())))?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.project_name.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("project_name is required".to_string()));
        }
        if self.experiment_name.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("experiment_name is required".to_string()));
        }
        if self.n_epochs == 0 {
            return Err(TrainingError::InvalidConfig("n_epochs must be >= 1".to_string()));
        }
        if self.num_classes == 0 {
            return Err(TrainingError::InvalidConfig("num_classes must be >= 1".to_string()));
        }
        if self.monitor_metric.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("monitor_metric is required".to_string()));
        }
        if self.log_every_n_steps == 0 {
            return Err(TrainingError::InvalidConfig("log_every_n_steps must be >= 1".to_string()));
        }
        if self.losses.is_empty() {
            return Err(TrainingError::InvalidConfig("at least one loss is required".to_string()));
        }
        for (idx, loss) in self.losses.iter().enumerate() {
            if loss.name.trim().is_empty() {
                return Err(TrainingError::InvalidConfig(format!("losses[{idx}].name is required")));
            }
            if !loss.weight.is_finite() || loss.weight < 0.0 {
                return Err(TrainingError::InvalidConfig(format!("losses[{idx}].weight must be >= 0")));
            }
        }
        self.data_config.validate()?;
        Ok(())
    }

    /// `model_kwargs.model_name`, the model registry key.
    pub fn model_name(&self) -> TrainingResult<&str> {
        self.model_kwargs
            .get("model_name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| TrainingError::InvalidConfig("model_kwargs.model_name is required".to_string()))
    }
}

impl DataConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("data_config.batch_size must be >= 1".to_string()));
        }
        if !(self.train_size > 0.0 && self.train_size < 1.0) {
            return Err(TrainingError::InvalidConfig("data_config.train_size must be in (0, 1)".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(TrainingError::InvalidConfig("data_config.width and height must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SAMPLE_YAML: &str = r"
project_name: posters
experiment_name: exp1
n_epochs: 3
num_classes: 4
accelerator: cpu
device: 0
monitor_metric: val_f1
monitor_mode: max
model_kwargs:
  model_name: linear
  pool: 4
optimizer: torch.optim.AdamW
optimizer_kwargs:
  lr: 0.001
  weight_decay: 0.00001
scheduler: torch.optim.lr_scheduler.CosineAnnealingLR
scheduler_kwargs:
  T_max: 10
  eta_min: 0.00001
losses:
  - name: bce
    weight: 1.0
    loss_fn: torch.nn.BCEWithLogitsLoss
    loss_kwargs: {}
data_config:
  data_path: ./data
  batch_size: 8
  n_workers: 2
  train_size: 0.8
  width: 32
  height: 32
";

    pub(crate) fn sample_config() -> Config {
        serde_yaml::from_str(SAMPLE_YAML).unwrap()
    }

    #[test]
    fn test_yaml_config_parses_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, SAMPLE_YAML).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.patience, 4);
        assert_eq!(config.log_every_n_steps, 50);
        assert_eq!(config.monitor_mode, MonitorMode::Max);
        assert_eq!(config.model_name().unwrap(), "linear");
        assert_eq!(config.losses[0].loss_fn, "torch.nn.BCEWithLogitsLoss");
    }

    #[test]
    fn test_toml_config_parses() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let config = sample_config();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.experiment_name, "exp1");
        assert_eq!(loaded.data_config.batch_size, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = sample_config();
        config.data_config.train_size = 1.0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.losses.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.losses[0].weight = -1.0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.n_epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_monitor_mode_is_a_parse_error() {
        let yaml = SAMPLE_YAML.replace("monitor_mode: max", "monitor_mode: biggest");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn test_monitor_mode_improves() {
        assert!(MonitorMode::Max.improves(0.5, 0.4, 0.0));
        assert!(!MonitorMode::Max.improves(0.4, 0.4, 0.0));
        assert!(MonitorMode::Min.improves(0.3, 0.4, 0.05));
        assert!(!MonitorMode::Min.improves(0.38, 0.4, 0.05));
        assert!(MonitorMode::Min.improves(1.0, MonitorMode::Min.worst(), 0.0));
    }
}
