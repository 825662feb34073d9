use crate::job::TrainingJobId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId },
    Message { job_id: TrainingJobId, message: String },
    Step { job_id: TrainingJobId, epoch: usize, step: u64, total: Option<u64>, loss: f64 },
    Epoch { job_id: TrainingJobId, epoch: usize, metrics: BTreeMap<String, f64> },
    Finished { job_id: TrainingJobId },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id } => info!(%job_id, "training started"),
            ProgressEvent::Message { job_id, message } => info!(%job_id, "{message}"),
            ProgressEvent::Step { job_id, epoch, step, total, loss } => match total {
                Some(total) => info!(%job_id, epoch, "step {step}/{total} loss={loss:.4}"),
                None => info!(%job_id, epoch, "step {step} loss={loss:.4}"),
            },
            ProgressEvent::Epoch { job_id, epoch, metrics } => {
                let summary = metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ");
                info!(%job_id, epoch, "{summary}");
            }
            ProgressEvent::Finished { job_id } => info!(%job_id, "training finished"),
        }
    }
}
