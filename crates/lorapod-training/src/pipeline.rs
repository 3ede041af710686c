//! The job handler: validate, resolve the model, stage the dataset, train, publish.

use crate::artifacts::make_artifact;
use crate::cache::ModelCache;
use crate::config::WorkerConfig;
use crate::dataset::stage_dataset;
use crate::error::{TrainingError, TrainingResult};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::job::{Job, JobInput, JobResult};
use crate::progress::{JobStage, ProgressEvent, ProgressSink, TracingProgressSink};
use crate::publish::{ArtifactPublisher, BucketPublisher};
use crate::trainer::{ScriptTrainer, Trainer, TrainingRun};
use crate::validation::validate_job_input;
use crate::workspace::{unsafe_job_id_message, JobWorkspace};
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobHandler {
    config: WorkerConfig,
    cache: ModelCache,
    fetcher: Arc<dyn Fetcher>,
    trainer: Arc<dyn Trainer>,
    publisher: Arc<dyn ArtifactPublisher>,
    progress: Arc<dyn ProgressSink>,
}

impl JobHandler {
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        trainer: Arc<dyn Trainer>,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        let cache = ModelCache::new(config.volume_dir.clone());
        Self { config, cache, fetcher, trainer, publisher, progress: Arc::new(TracingProgressSink) }
    }

    /// Production wiring: HTTP downloads, `accelerate` trainer, bucket uploads.
    pub fn from_config(config: WorkerConfig) -> TrainingResult<Self> {
        let fetcher = Arc::new(HttpFetcher::new()?);
        let trainer = Arc::new(ScriptTrainer::new(config.trainer.clone()));
        let publisher = Arc::new(BucketPublisher::new(config.storage.clone()));
        Ok(Self::new(config, fetcher, trainer, publisher))
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Run one job to completion.
    ///
    /// Invalid input is not an error: it yields [`JobResult::Rejected`] without touching
    /// the filesystem or network. Every other failure aborts the job and is returned.
    pub async fn handle(&self, job: &Job) -> TrainingResult<JobResult> {
        self.emit(ProgressEvent::Stage { job_id: job.id.clone(), stage: JobStage::Validating });

        // The id names the workspace and, without `out_id`, the artifact.
        let mut errors = Vec::new();
        if !job.id.is_path_safe() {
            errors.push(unsafe_job_id_message(&job.id));
        }
        let input = match validate_job_input(&job.input) {
            Ok(input) if errors.is_empty() => input,
            Ok(_) => {
                warn!(job_id = %job.id, "job id rejected");
                return Ok(JobResult::Rejected { error: errors });
            }
            Err(TrainingError::Validation(input_errors)) => {
                errors.extend(input_errors);
                warn!(job_id = %job.id, errors = errors.len(), "job input rejected");
                return Ok(JobResult::Rejected { error: errors });
            }
            Err(e) => return Err(e),
        };

        let mut stage = JobStage::Validating;
        match self.run(job, &input, &mut stage).await {
            Ok(url) => {
                self.emit(ProgressEvent::Finished { job_id: job.id.clone(), url: url.clone() });
                Ok(JobResult::Published { lora: url })
            }
            Err(e) => {
                self.emit(ProgressEvent::Failed {
                    job_id: job.id.clone(),
                    stage,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, job: &Job, input: &JobInput, stage: &mut JobStage) -> TrainingResult<String> {
        self.enter(job, stage, JobStage::ResolvingModel);
        let workspace =
            JobWorkspace::create(&self.config.work_root, &job.id, self.config.retain_workspace)?;
        let model = self
            .cache
            .resolve(&input.model_url, self.fetcher.as_ref(), &workspace.downloads_dir())
            .await?;
        info!(job_id = %job.id, cache_key = %model.cache_key, outcome = ?model.outcome, "base model ready");

        self.enter(job, stage, JobStage::StagingDataset);
        let dataset = stage_dataset(
            self.fetcher.as_ref(),
            &input.zip_url,
            &workspace,
            &input.image_folder_name(),
        )
        .await?;
        self.emit(ProgressEvent::Message {
            job_id: job.id.clone(),
            message: format!("staged {} images", dataset.images.len()),
        });

        self.enter(job, stage, JobStage::Training);
        let run = TrainingRun::new(&job.id, input, &workspace, model.path);
        info!(job_id = %job.id, trainer = self.trainer.id(), "training");
        self.trainer.train(&run).await?;

        self.enter(job, stage, JobStage::Publishing);
        let artifact_path = run.artifact_path();
        let artifact = tokio::task::spawn_blocking(move || make_artifact(artifact_path))
            .await
            .map_err(anyhow::Error::from)??;
        self.emit(ProgressEvent::Message {
            job_id: job.id.clone(),
            message: format!(
                "artifact {} ({} bytes, sha256 {})",
                artifact.name, artifact.size_bytes, artifact.sha256
            ),
        });
        self.publisher.publish(&artifact, job.s3_config.as_ref()).await
    }

    fn enter(&self, job: &Job, current: &mut JobStage, next: JobStage) {
        *current = next;
        self.emit(ProgressEvent::Stage { job_id: job.id.clone(), stage: next });
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::write_zip;
    use crate::job::{sample_input, JobId};
    use crate::progress::testing::RecordingSink;
    use crate::publish::StorePublisher;
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStoreExt;
    use reqwest::Url;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves the model bytes for `.safetensors` URLs and a fixed archive for everything else.
    struct FakeFetcher {
        archive: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> TrainingResult<u64> {
            self.calls.lock().unwrap().push(url.to_string());
            if url.ends_with(".safetensors") {
                std::fs::write(dest, b"base-model")?;
                return Ok(10);
            }
            Ok(std::fs::copy(&self.archive, dest)?)
        }
    }

    /// Records what it was asked to train on and writes a fake adapter.
    #[derive(Default)]
    struct FakeTrainer {
        seen_images: Mutex<Vec<String>>,
        seen_runs: Mutex<Vec<TrainingRun>>,
        fail: bool,
    }

    #[async_trait]
    impl Trainer for FakeTrainer {
        fn id(&self) -> &'static str {
            "fake"
        }

        async fn train(&self, run: &TrainingRun) -> TrainingResult<()> {
            let mut names: Vec<String> = std::fs::read_dir(run.train_data_dir.join("10_sks dog"))?
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            *self.seen_images.lock().unwrap() = names;
            self.seen_runs.lock().unwrap().push(run.clone());

            if self.fail {
                return Err(TrainingError::Trainer("accelerate exited with exit status: 1".to_string()));
            }
            std::fs::write(run.artifact_path(), b"trained-lora")?;
            Ok(())
        }
    }

    struct Harness {
        temp: TempDir,
        store: Arc<InMemory>,
        trainer: Arc<FakeTrainer>,
        fetcher: Arc<FakeFetcher>,
        progress: Arc<RecordingSink>,
        handler: JobHandler,
    }

    fn harness(fail_training: bool) -> Harness {
        harness_with(
            fail_training,
            true,
            &[("dog/a.png", "a"), ("dog/b.jpg", "b"), ("__MACOSX/dog/._a.png", "m")],
        )
    }

    fn harness_with(fail_training: bool, attach_volume: bool, entries: &[(&str, &str)]) -> Harness {
        let temp = TempDir::new().unwrap();
        let volume = temp.path().join("volume");
        if attach_volume {
            std::fs::create_dir_all(&volume).unwrap();
        }

        let archive = temp.path().join("dataset.zip");
        write_zip(&archive, entries);

        let config = WorkerConfig {
            volume_dir: volume,
            work_root: temp.path().join("training"),
            ..Default::default()
        };
        let store = Arc::new(InMemory::new());
        let trainer = Arc::new(FakeTrainer { fail: fail_training, ..Default::default() });
        let fetcher = Arc::new(FakeFetcher { archive, calls: Mutex::default() });
        let progress = Arc::new(RecordingSink::default());
        let publisher = StorePublisher::new(store.clone(), Url::parse("memory://loras/").unwrap());

        let handler = JobHandler::new(config, fetcher.clone(), trainer.clone(), Arc::new(publisher))
            .with_progress(progress.clone());

        Harness { temp, store, trainer, fetcher, progress, handler }
    }

    fn job(input: serde_json::Value) -> Job {
        Job { id: JobId::from("j1"), input, s3_config: None }
    }

    fn valid_input() -> serde_json::Value {
        serde_json::to_value(sample_input()).unwrap()
    }

    fn workspaces(h: &Harness) -> usize {
        let root = h.temp.path().join("training");
        if !root.exists() {
            return 0;
        }
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn test_successful_job_publishes_lora() {
        let h = harness(false);

        let result = h.handler.handle(&job(valid_input())).await.unwrap();

        assert_eq!(result, JobResult::Published { lora: "memory://loras/j1.safetensors".to_string() });
        assert_eq!(serde_json::to_value(&result).unwrap(), json!({"lora": "memory://loras/j1.safetensors"}));

        assert_eq!(*h.trainer.seen_images.lock().unwrap(), vec!["a.png", "b.jpg"]);
        let runs = h.trainer.seen_runs.lock().unwrap().clone();
        assert_eq!(runs[0].model_path, h.temp.path().join("volume").join("m.safetensors"));
        assert_eq!(runs[0].hyperparams.max_train_steps, 1350);

        let stored = h.store.get(&ObjectPath::from("j1.safetensors")).await.unwrap().bytes().await.unwrap();
        assert_eq!(stored.as_ref(), b"trained-lora");

        assert_eq!(
            h.progress.stages(),
            vec![
                JobStage::Validating,
                JobStage::ResolvingModel,
                JobStage::StagingDataset,
                JobStage::Training,
                JobStage::Publishing,
            ]
        );
        assert!(matches!(h.progress.events().last(), Some(ProgressEvent::Finished { .. })));
        assert_eq!(workspaces(&h), 0);
    }

    #[tokio::test]
    async fn test_second_job_reuses_cached_model() {
        let h = harness(false);

        h.handler.handle(&job(valid_input())).await.unwrap();
        h.handler.handle(&job(valid_input())).await.unwrap();

        let model_downloads = h
            .fetcher
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.ends_with(".safetensors"))
            .count();
        assert_eq!(model_downloads, 1);
    }

    #[tokio::test]
    async fn test_out_id_names_the_artifact() {
        let h = harness(false);
        let mut input = sample_input();
        input.out_id = Some("my-lora".to_string());

        let result = h.handler.handle(&job(serde_json::to_value(input).unwrap())).await.unwrap();

        assert_eq!(result, JobResult::Published { lora: "memory://loras/my-lora.safetensors".to_string() });
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_without_side_effects() {
        let h = harness(false);
        let mut input = valid_input();
        input.as_object_mut().unwrap().remove("zip_url");

        let result = h.handler.handle(&job(input)).await.unwrap();

        let JobResult::Rejected { error } = result else {
            panic!("expected rejection");
        };
        assert_eq!(error, vec!["zip_url is a required input.".to_string()]);
        assert!(h.fetcher.calls.lock().unwrap().is_empty());
        assert!(!h.temp.path().join("training").exists());
        assert_eq!(h.progress.stages(), vec![JobStage::Validating]);
    }

    #[tokio::test]
    async fn test_trainer_failure_propagates_and_cleans_up() {
        let h = harness(true);

        let err = h.handler.handle(&job(valid_input())).await.unwrap_err();

        assert!(matches!(err, TrainingError::Trainer(_)));
        assert!(matches!(
            h.progress.events().last(),
            Some(ProgressEvent::Failed { stage: JobStage::Training, .. })
        ));
        assert_eq!(workspaces(&h), 0);
        assert!(h.store.get(&ObjectPath::from("j1.safetensors")).await.is_err());
    }

    #[tokio::test]
    async fn test_job_without_volume_stages_images_only() {
        let h = harness_with(false, false, &[("dog/a.png", "a"), ("dog/notes.txt", "n")]);
        let mut input = valid_input();
        input["out_id"] = serde_json::Value::Null;

        let result = h.handler.handle(&job(input)).await.unwrap();

        assert_eq!(serde_json::to_value(&result).unwrap(), json!({"lora": "memory://loras/j1.safetensors"}));
        assert_eq!(*h.trainer.seen_images.lock().unwrap(), vec!["a.png".to_string()]);

        let runs = h.trainer.seen_runs.lock().unwrap();
        assert_eq!(runs[0].artifact_path().file_name().unwrap(), "j1.safetensors");
        // Without a volume the model lives in the job workspace and goes away with it.
        assert!(runs[0].model_path.starts_with(h.temp.path().join("training")));
        assert!(!h.temp.path().join("volume").exists());
        assert_eq!(workspaces(&h), 0);

        let stored = h.store.get(&ObjectPath::from("j1.safetensors")).await.unwrap();
        assert_eq!(stored.bytes().await.unwrap().as_ref(), b"trained-lora");
    }

    #[tokio::test]
    async fn test_job_id_that_is_not_a_file_name_is_rejected() {
        let h = harness(false);

        for id in ["../escaped", "a/b"] {
            let job = Job { id: JobId::from(id), input: valid_input(), s3_config: None };
            let result = h.handler.handle(&job).await.unwrap();

            let JobResult::Rejected { error } = result else {
                panic!("expected rejection for {id}");
            };
            assert_eq!(error, vec![format!("Job id {id:?} cannot be used as a file name.")]);
        }

        assert!(h.fetcher.calls.lock().unwrap().is_empty());
        assert!(h.trainer.seen_runs.lock().unwrap().is_empty());
        assert!(!h.temp.path().join("training").exists());
        assert!(!h.temp.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_bad_job_id_is_reported_with_input_errors() {
        let h = harness(false);
        let mut input = valid_input();
        input.as_object_mut().unwrap().remove("zip_url");
        let job = Job { id: JobId::from(".."), input, s3_config: None };

        let JobResult::Rejected { error } = h.handler.handle(&job).await.unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(
            error,
            vec![
                "Job id \"..\" cannot be used as a file name.".to_string(),
                "zip_url is a required input.".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_workspace_failure_is_reported_while_resolving_model() {
        let h = harness(false);
        // A file where the work root should be.
        std::fs::write(h.temp.path().join("training"), b"").unwrap();

        let err = h.handler.handle(&job(valid_input())).await.unwrap_err();

        assert!(matches!(err, TrainingError::Io(_)), "{err}");
        assert_eq!(h.progress.stages(), vec![JobStage::Validating, JobStage::ResolvingModel]);
        assert!(matches!(
            h.progress.events().last(),
            Some(ProgressEvent::Failed { stage: JobStage::ResolvingModel, .. })
        ));
        assert!(h.fetcher.calls.lock().unwrap().is_empty());
    }
}
