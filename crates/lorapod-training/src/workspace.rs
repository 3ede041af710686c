use crate::error::{TrainingError, TrainingResult};
use crate::job::JobId;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Filesystem layout for one job.
///
/// Layout under `<work_root>/<job_id>-<random>/`:
///
/// ```text
/// img/<steps>_<instance> <class>/   flattened training images
/// model/                            trainer output
/// logs/
/// downloads/                        fetched archives (and uncached models)
/// extracted/                        unpacked dataset archive
/// ```
///
/// The directory is removed when the workspace is dropped unless it was created with
/// `retain = true`.
#[derive(Debug)]
pub struct JobWorkspace {
    root: PathBuf,
    guard: Option<TempDir>,
}

impl JobWorkspace {
    /// Acquire a fresh workspace for `job_id` under `work_root`.
    pub fn create(work_root: &Path, job_id: &JobId, retain: bool) -> TrainingResult<Self> {
        if !job_id.is_path_safe() {
            return Err(TrainingError::Validation(vec![unsafe_job_id_message(job_id)]));
        }
        std::fs::create_dir_all(work_root)?;
        let work_root = std::path::absolute(work_root)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", job_id.as_str()))
            .tempdir_in(&work_root)?;

        let workspace = if retain {
            let root = dir.keep();
            info!(job_id = %job_id, path = %root.display(), "job workspace will be retained");
            Self { root, guard: None }
        } else {
            Self { root: dir.path().to_path_buf(), guard: Some(dir) }
        };

        std::fs::create_dir_all(workspace.downloads_dir())?;
        debug!(job_id = %job_id, path = %workspace.root.display(), "created job workspace");
        Ok(workspace)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `train_data_dir` handed to the trainer.
    #[must_use]
    pub fn img_dir(&self) -> PathBuf {
        self.root.join("img")
    }

    #[must_use]
    pub fn image_folder(&self, folder_name: &str) -> PathBuf {
        self.img_dir().join(folder_name)
    }

    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    #[must_use]
    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    /// Create the training tree (`img/<folder_name>`, `model`, `logs`). Idempotent.
    pub fn ensure_training_dirs(&self, folder_name: &str) -> TrainingResult<PathBuf> {
        let image_folder = self.image_folder(folder_name);
        std::fs::create_dir_all(&image_folder)?;
        std::fs::create_dir_all(self.model_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(image_folder)
    }

    /// Whether the directory is deleted on drop.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.guard.is_some()
    }
}

pub(crate) fn unsafe_job_id_message(job_id: &JobId) -> String {
    format!("Job id {:?} cannot be used as a file name.", job_id.as_str())
}
