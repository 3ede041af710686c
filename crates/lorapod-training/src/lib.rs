//! LoRA training jobs
//!
//! Everything a serverless worker needs to turn one job into a published adapter:
//! - Validating raw job input (`validation`)
//! - Caching base models on a shared volume (`cache`)
//! - Staging image datasets from zip archives (`dataset`)
//! - Running the external trainer (`Trainer`)
//! - Publishing the result to object storage (`ArtifactPublisher`)
//!
//! [`JobHandler`] wires the stages together.

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod trainer;
pub mod validation;
pub mod workspace;

pub use artifacts::{make_artifact, sha256_file, TrainingArtifact};
pub use cache::{CacheOutcome, ModelCache, ResolvedModel};
pub use config::{QueueSettings, StorageSettings, TrainerSettings, WorkerConfig};
pub use dataset::{stage_dataset, StagedDataset};
pub use error::{TrainingError, TrainingResult};
pub use fetch::{Fetcher, HttpFetcher};
pub use job::{BucketConfig, Job, JobId, JobInput, JobResult};
pub use pipeline::JobHandler;
pub use progress::{JobStage, ProgressEvent, ProgressSink, TracingProgressSink};
pub use publish::{ArtifactPublisher, BucketPublisher, StorePublisher};
pub use trainer::{HyperParams, ScriptTrainer, Trainer, TrainingRun};
pub use validation::{input_schema, validate, validate_job_input};
pub use workspace::JobWorkspace;
