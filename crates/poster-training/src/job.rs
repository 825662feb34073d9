use crate::config::Config;
use crate::error::TrainingResult;
use crate::registry::Registries;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One fit-and-test run of an experiment config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub config: Config,
}

impl TrainingJob {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { job_id: TrainingJobId::new(), created_at: Utc::now(), config }
    }

    /// Config values plus every registry key they name.
    pub fn validate(&self, registries: &Registries) -> TrainingResult<()> {
        self.config.validate()?;
        registries.validate(&self.config)
    }
}
