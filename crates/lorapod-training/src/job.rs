use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a directory or file without leaving its parent.
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        crate::validation::is_file_token(&self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A job as delivered by the queue: identifier, raw input and optional bucket credentials.
///
/// `input` stays untyped until it has been run through the schema validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: JobId,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(rename = "s3Config", default, skip_serializing_if = "Option::is_none")]
    pub s3_config: Option<BucketConfig>,
}

/// Per-job object storage credentials (`s3Config`).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("access_id", &self.access_id)
            .field("access_secret", &self.access_secret.as_ref().map(|_| "<redacted>"))
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Job input after schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub model_url: String,
    pub zip_url: String,
    pub instance_name: String,
    pub class_name: String,
    pub steps: u32,
    pub unet_lr: f64,
    pub network_dim: u32,
    pub lr_scheduler: String,
    pub learning_rate: f64,
    pub lr_scheduler_num_cycles: u32,
    pub lr_warmup_steps: u32,
    pub train_batch_size: u32,
    pub max_train_steps: u32,
    pub max_data_loader_num_workers: u32,
    pub optimizer_type: String,
    #[serde(default)]
    pub out_id: Option<String>,
}

impl JobInput {
    /// Name of the image folder the trainer reads repeats and captions from:
    /// `<steps>_<instance_name> <class_name>`.
    #[must_use]
    pub fn image_folder_name(&self) -> String {
        format!("{}_{} {}", self.steps, self.instance_name, self.class_name)
    }

    /// Output name of the trained adapter; falls back to the job id.
    #[must_use]
    pub fn output_name(&self, job_id: &JobId) -> String {
        self.out_id.clone().unwrap_or_else(|| job_id.0.clone())
    }
}

/// What a job hands back to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    /// `{"lora": "<url>"}`
    Published { lora: String },
    /// `{"error": ["..."]}`
    Rejected { error: Vec<String> },
}

#[cfg(test)]
pub(crate) fn sample_input() -> JobInput {
    JobInput {
        model_url: "https://x/m.safetensors".to_string(),
        zip_url: "https://x/d.zip".to_string(),
        instance_name: "sks".to_string(),
        class_name: "dog".to_string(),
        steps: 10,
        unet_lr: 0.0001,
        network_dim: 256,
        lr_scheduler: "cosine_with_restarts".to_string(),
        learning_rate: 0.0002,
        lr_scheduler_num_cycles: 3,
        lr_warmup_steps: 270,
        train_batch_size: 2,
        max_train_steps: 1350,
        max_data_loader_num_workers: 4,
        optimizer_type: "AdamW8bit".to_string(),
        out_id: None,
    }
}
