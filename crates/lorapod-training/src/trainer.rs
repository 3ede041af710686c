use crate::config::TrainerSettings;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{JobId, JobInput};
use crate::workspace::JobWorkspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Hyperparameters taken from validated job input and passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
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
}

impl From<&JobInput> for HyperParams {
    fn from(input: &JobInput) -> Self {
        Self {
            unet_lr: input.unet_lr,
            network_dim: input.network_dim,
            lr_scheduler: input.lr_scheduler.clone(),
            learning_rate: input.learning_rate,
            lr_scheduler_num_cycles: input.lr_scheduler_num_cycles,
            lr_warmup_steps: input.lr_warmup_steps,
            train_batch_size: input.train_batch_size,
            max_train_steps: input.max_train_steps,
            max_data_loader_num_workers: input.max_data_loader_num_workers,
            optimizer_type: input.optimizer_type.clone(),
        }
    }
}

/// Everything one training invocation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRun {
    pub job_id: JobId,
    pub model_path: PathBuf,
    /// Parent of the `<steps>_<instance> <class>` folder.
    pub train_data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub output_name: String,
    pub hyperparams: HyperParams,
}

impl TrainingRun {
    #[must_use]
    pub fn new(job_id: &JobId, input: &JobInput, workspace: &JobWorkspace, model_path: PathBuf) -> Self {
        Self {
            job_id: job_id.clone(),
            model_path,
            train_data_dir: workspace.img_dir(),
            output_dir: workspace.model_dir(),
            output_name: input.output_name(job_id),
            hyperparams: HyperParams::from(input),
        }
    }

    /// Where the trainer writes the adapter.
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.safetensors", self.output_name))
    }
}

/// A training backend.
///
/// `train` runs to completion; there is no cancellation once started.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn train(&self, run: &TrainingRun) -> TrainingResult<()>;
}

/// Runs an sd-scripts network training script through `accelerate launch`.
#[derive(Debug, Clone, Default)]
pub struct ScriptTrainer {
    settings: TrainerSettings,
}

impl ScriptTrainer {
    #[must_use]
    pub fn new(settings: TrainerSettings) -> Self {
        Self { settings }
    }

    /// Arguments after the launcher binary.
    #[must_use]
    pub fn command_args(&self, run: &TrainingRun) -> Vec<String> {
        let s = &self.settings;
        let hp = &run.hyperparams;

        vec![
            "launch".to_string(),
            format!("--num_cpu_threads_per_process={}", s.num_cpu_threads_per_process),
            s.script.clone(),
            "--enable_bucket".to_string(),
            format!("--pretrained_model_name_or_path={}", run.model_path.display()),
            format!("--train_data_dir={}", run.train_data_dir.display()),
            format!("--resolution={}", s.resolution),
            format!("--network_alpha={}", s.network_alpha),
            format!("--text_encoder_lr={}", s.text_encoder_lr),
            "--no_half_vae".to_string(),
            format!("--mixed_precision={}", s.mixed_precision),
            format!("--save_precision={}", s.save_precision),
            "--full_fp16".to_string(),
            "--gradient_checkpointing".to_string(),
            format!("--unet_lr={}", hp.unet_lr),
            format!("--network_dim={}", hp.network_dim),
            format!("--lr_scheduler={}", hp.lr_scheduler),
            format!("--learning_rate={}", hp.learning_rate),
            format!("--lr_scheduler_num_cycles={}", hp.lr_scheduler_num_cycles),
            format!("--lr_warmup_steps={}", hp.lr_warmup_steps),
            format!("--train_batch_size={}", hp.train_batch_size),
            format!("--max_train_steps={}", hp.max_train_steps),
            format!("--output_dir={}", run.output_dir.display()),
            format!("--output_name={}", run.output_name),
            format!("--max_data_loader_n_workers={}", hp.max_data_loader_num_workers),
            "--save_model_as=safetensors".to_string(),
            "--network_module=networks.lora".to_string(),
            format!("--optimizer_type={}", hp.optimizer_type),
            "--cache_latents".to_string(),
            format!("--bucket_reso_steps={}", s.bucket_reso_steps),
            "--bucket_no_upscale".to_string(),
        ]
    }

    #[must_use]
    pub fn command(&self, run: &TrainingRun) -> Command {
        let mut cmd = Command::new(&self.settings.launcher);
        cmd.args(self.command_args(run))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        if let Some(dir) = &self.settings.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Trainer for ScriptTrainer {
    fn id(&self) -> &'static str {
        "sd-scripts"
    }

    async fn train(&self, run: &TrainingRun) -> TrainingResult<()> {
        info!(
            job_id = %run.job_id,
            launcher = %self.settings.launcher,
            script = %self.settings.script,
            output = %run.artifact_path().display(),
            "launching trainer"
        );
        debug!(args = ?self.command_args(run), "trainer command");

        let status = self.command(run).status().await.map_err(|e| {
            TrainingError::Trainer(format!("failed to launch {}: {e}", self.settings.launcher))
        })?;

        if !status.success() {
            return Err(TrainingError::Trainer(format!(
                "{} {} exited with {status}",
                self.settings.launcher, self.settings.script
            )));
        }

        let artifact = run.artifact_path();
        if !artifact.is_file() {
            return Err(TrainingError::Artifact(format!(
                "trainer finished but {} was not produced",
                artifact.display()
            )));
        }

        info!(job_id = %run.job_id, "trainer finished");
        Ok(())
    }
}
