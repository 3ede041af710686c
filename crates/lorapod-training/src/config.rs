//! Worker configuration.
//!
//! Loaded from TOML files (global `~/.lorapod/config.toml`, then local `./lorapod.toml`)
//! with environment variables applied last.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_VOLUME_DIR: &str = "/runpod-volume";
pub const DEFAULT_WORK_ROOT: &str = "./training";

/// Top-level worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: Option<String>,
    /// Shared persistent volume used as the model cache.
    pub volume_dir: PathBuf,
    /// Parent directory of per-job workspaces.
    pub work_root: PathBuf,
    /// Keep job workspaces after the job finishes.
    pub retain_workspace: bool,
    pub trainer: TrainerSettings,
    pub storage: StorageSettings,
    pub queue: QueueSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            volume_dir: PathBuf::from(DEFAULT_VOLUME_DIR),
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            retain_workspace: false,
            trainer: TrainerSettings::default(),
            storage: StorageSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// Fixed settings of the external training command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub launcher: String,
    pub script: String,
    pub num_cpu_threads_per_process: u32,
    pub resolution: String,
    pub network_alpha: u32,
    pub text_encoder_lr: f64,
    pub mixed_precision: String,
    pub save_precision: String,
    pub bucket_reso_steps: u32,
    /// Directory the trainer is launched from (where the script lives).
    pub working_dir: Option<PathBuf>,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            launcher: "accelerate".to_string(),
            script: "sdxl_train_network.py".to_string(),
            num_cpu_threads_per_process: 1,
            resolution: "1024,1024".to_string(),
            network_alpha: 1,
            text_encoder_lr: 5e-5,
            mixed_precision: "fp16".to_string(),
            save_precision: "fp16".to_string(),
            bucket_reso_steps: 64,
            working_dir: None,
        }
    }
}

/// Object storage defaults; a job's `s3Config` overrides these per field.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
    pub default_bucket: Option<String>,
    pub presign_expiry_secs: u64,
    /// Where artifacts go when no endpoint is configured.
    pub local_fallback_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            region: None,
            default_bucket: None,
            presign_expiry_secs: 7 * 24 * 60 * 60,
            local_fallback_dir: PathBuf::from("simulated_uploaded"),
        }
    }
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("default_bucket", &self.default_bucket)
            .field("presign_expiry_secs", &self.presign_expiry_secs)
            .field("local_fallback_dir", &self.local_fallback_dir)
            .finish()
    }
}

/// Job queue endpoints used by `serve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub take_url: Option<String>,
    /// `$ID` is replaced with the job id.
    pub done_url: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { take_url: None, done_url: None, api_key: None, poll_interval_secs: 5 }
    }
}

impl WorkerConfig {
    /// Load configuration from a single TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let table = read_table(path)?;
        Self::from_table(table, path)
    }

    /// Default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lorapod")
            .join("config.toml")
    }

    /// Default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from("lorapod.toml")
    }

    /// Discover and load configuration files.
    ///
    /// Local config overrides global config key by key. Missing files are skipped;
    /// files that exist but do not parse are errors.
    pub fn discover_and_load() -> TrainingResult<Self> {
        Self::load_layered(&[Self::default_global_path(), Self::default_local_path()])
    }

    /// Load and merge the given files in order, later files winning.
    pub fn load_layered(paths: &[PathBuf]) -> TrainingResult<Self> {
        let mut merged = toml::Table::new();
        let mut last = PathBuf::from("<defaults>");
        for path in paths {
            if !path.exists() {
                continue;
            }
            merge_tables(&mut merged, read_table(path)?);
            last.clone_from(path);
        }
        Self::from_table(merged, &last)
    }

    /// Apply process environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("LORAPOD_VOLUME_DIR") {
            self.volume_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("LORAPOD_WORK_ROOT") {
            self.work_root = PathBuf::from(dir);
        }
        if let Some(url) = get("BUCKET_ENDPOINT_URL") {
            self.storage.endpoint_url = Some(url);
        }
        if let Some(key) = get("BUCKET_ACCESS_KEY_ID") {
            self.storage.access_key_id = Some(key);
        }
        if let Some(secret) = get("BUCKET_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = Some(secret);
        }
        if let Some(url) = get("LORAPOD_QUEUE_TAKE_URL") {
            self.queue.take_url = Some(url);
        }
        if let Some(url) = get("LORAPOD_QUEUE_DONE_URL") {
            self.queue.done_url = Some(url);
        }
        if let Some(key) = get("LORAPOD_QUEUE_API_KEY") {
            self.queue.api_key = Some(key);
        }
    }

    fn from_table(table: toml::Table, origin: &Path) -> TrainingResult<Self> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e| TrainingError::Config(format!("{}: {}", origin.display(), e)))
    }
}

fn read_table(path: &Path) -> TrainingResult<toml::Table> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TrainingError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| TrainingError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Recursively merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
