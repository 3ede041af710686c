use crate::job::JobId;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Validating,
    ResolvingModel,
    StagingDataset,
    Training,
    Publishing,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::ResolvingModel => "resolving_model",
            Self::StagingDataset => "staging_dataset",
            Self::Training => "training",
            Self::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage { job_id: JobId, stage: JobStage },
    Message { job_id: JobId, message: String },
    Finished { job_id: JobId, url: String },
    Failed { job_id: JobId, stage: JobStage, error: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Emits progress as structured log records.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Stage { job_id, stage } => info!(job_id = %job_id, %stage, "stage started"),
            ProgressEvent::Message { job_id, message } => info!(job_id = %job_id, "{message}"),
            ProgressEvent::Finished { job_id, url } => info!(job_id = %job_id, url = %url, "job finished"),
            ProgressEvent::Failed { job_id, stage, error } => {
                error!(job_id = %job_id, %stage, error = %error, "job failed");
            }
        }
    }
}
