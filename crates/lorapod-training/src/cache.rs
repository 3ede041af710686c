//! Base model cache on a shared persistent volume.
//!
//! Entries are keyed by the file name of the model URL and are immutable once published.
//! A miss downloads into a hidden staging file inside the volume and publishes it with a
//! no-clobber rename, so concurrent misses for the same key converge on a single file and
//! a failed download never leaves a partial entry under the key.

use crate::error::{TrainingError, TrainingResult};
use crate::fetch::{url_file_name, Fetcher};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a model path was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Already on the volume; nothing was downloaded.
    Hit,
    /// Downloaded and published to the volume by this job.
    Stored,
    /// Downloaded, but another job published the same key first; its copy is used.
    StoredByPeer,
    /// No volume attached; the download is used in place.
    Uncached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub path: PathBuf,
    pub cache_key: String,
    pub outcome: CacheOutcome,
}

#[derive(Debug, Clone)]
pub struct ModelCache {
    volume_dir: PathBuf,
}

impl ModelCache {
    #[must_use]
    pub fn new(volume_dir: impl Into<PathBuf>) -> Self {
        Self { volume_dir: volume_dir.into() }
    }

    /// A volume is attached when its root directory exists.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.volume_dir.is_dir()
    }

    #[must_use]
    pub fn entry_path(&self, cache_key: &str) -> PathBuf {
        self.volume_dir.join(cache_key)
    }

    /// Resolve `model_url` to a local file.
    ///
    /// `scratch_dir` receives the download when no volume is attached.
    pub async fn resolve(
        &self,
        model_url: &str,
        fetcher: &dyn Fetcher,
        scratch_dir: &Path,
    ) -> TrainingResult<ResolvedModel> {
        let cache_key = url_file_name(model_url)?;
        let entry = self.entry_path(&cache_key);

        if entry.is_file() {
            info!(cache_key = %cache_key, path = %entry.display(), "model found in volume, using cached copy");
            return Ok(ResolvedModel { path: entry, cache_key, outcome: CacheOutcome::Hit });
        }

        if !self.is_available() {
            let path = scratch_dir.join(&cache_key);
            info!(cache_key = %cache_key, volume = %self.volume_dir.display(), "no volume attached, model will not be cached");
            fetcher.fetch(model_url, &path).await?;
            return Ok(ResolvedModel { path, cache_key, outcome: CacheOutcome::Uncached });
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{cache_key}."))
            .suffix(".partial")
            .tempfile_in(&self.volume_dir)
            .map_err(|e| {
                TrainingError::Cache(format!(
                    "failed to create staging file in {}: {e}",
                    self.volume_dir.display()
                ))
            })?;

        info!(cache_key = %cache_key, "model not cached, downloading into volume");
        // Dropping `staging` on error removes the partial download.
        fetcher.fetch(model_url, staging.path()).await?;

        let outcome = match staging.persist_noclobber(&entry) {
            Ok(_) => {
                info!(cache_key = %cache_key, path = %entry.display(), "model cached");
                CacheOutcome::Stored
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(cache_key = %cache_key, "model was cached by another job during download, discarding ours");
                drop(e.file);
                CacheOutcome::StoredByPeer
            }
            Err(e) => {
                return Err(TrainingError::Cache(format!(
                    "failed to publish {}: {}",
                    entry.display(),
                    e.error
                )));
            }
        };

        debug!(cache_key = %cache_key, ?outcome, "model resolved");
        Ok(ResolvedModel { path: entry, cache_key, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes fixed content and records every URL it was asked for.
    #[derive(Default)]
    struct RecordingFetcher {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingFetcher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for RecordingFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> TrainingResult<u64> {
            self.calls.lock().unwrap().push(url.to_string());
            std::fs::write(dest, b"partial")?;
            if self.fail {
                return Err(TrainingError::Download("connection reset".to_string()));
            }
            std::fs::write(dest, b"model-bytes")?;
            Ok(11)
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_hit_skips_download() {
        let volume = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let cached = volume.path().join("m.safetensors");
        std::fs::write(&cached, b"cached").unwrap();

        let fetcher = RecordingFetcher::default();
        let cache = ModelCache::new(volume.path());
        let resolved = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap();

        assert_eq!(resolved.outcome, CacheOutcome::Hit);
        assert_eq!(resolved.path, cached);
        assert!(fetcher.calls().is_empty());
        assert_eq!(std::fs::read(&cached).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_miss_stores_in_volume_without_leftovers() {
        let volume = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();

        let fetcher = RecordingFetcher::default();
        let cache = ModelCache::new(volume.path());
        let resolved = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap();

        assert_eq!(resolved.outcome, CacheOutcome::Stored);
        assert_eq!(resolved.cache_key, "m.safetensors");
        assert_eq!(resolved.path, volume.path().join("m.safetensors"));
        assert_eq!(std::fs::read(&resolved.path).unwrap(), b"model-bytes");
        assert_eq!(dir_entries(volume.path()), vec!["m.safetensors".to_string()]);
        assert!(dir_entries(scratch.path()).is_empty());
        assert_eq!(fetcher.calls(), vec!["https://x/m.safetensors".to_string()]);

        // Second resolution is a hit.
        let again = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap();
        assert_eq!(again.outcome, CacheOutcome::Hit);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_volume_uses_download_in_place() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();

        let fetcher = RecordingFetcher::default();
        let cache = ModelCache::new(root.path().join("no-volume"));
        let resolved = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap();

        assert_eq!(resolved.outcome, CacheOutcome::Uncached);
        assert_eq!(resolved.path, scratch.path().join("m.safetensors"));
        assert!(resolved.path.is_file());
        assert!(!root.path().join("no-volume").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_entry() {
        let volume = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();

        let fetcher = RecordingFetcher { fail: true, ..Default::default() };
        let cache = ModelCache::new(volume.path());
        let err = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap_err();

        assert!(matches!(err, TrainingError::Download(_)));
        assert!(dir_entries(volume.path()).is_empty());
    }

    #[tokio::test]
    async fn test_peer_published_first() {
        let volume = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let entry = volume.path().join("m.safetensors");

        /// Simulates another job publishing the entry while this one downloads.
        struct RacingFetcher {
            entry: PathBuf,
        }

        #[async_trait]
        impl Fetcher for RacingFetcher {
            async fn fetch(&self, _url: &str, dest: &Path) -> TrainingResult<u64> {
                std::fs::write(&self.entry, b"peer-bytes")?;
                std::fs::write(dest, b"our-bytes")?;
                Ok(9)
            }
        }

        let cache = ModelCache::new(volume.path());
        let fetcher = RacingFetcher { entry: entry.clone() };
        let resolved = cache.resolve("https://x/m.safetensors", &fetcher, scratch.path()).await.unwrap();

        assert_eq!(resolved.outcome, CacheOutcome::StoredByPeer);
        assert_eq!(std::fs::read(&entry).unwrap(), b"peer-bytes");
        assert_eq!(dir_entries(volume.path()), vec!["m.safetensors".to_string()]);
    }

    #[tokio::test]
    async fn test_url_without_file_name_rejected_before_download() {
        let volume = TempDir::new().unwrap();
        let fetcher = RecordingFetcher::default();
        let cache = ModelCache::new(volume.path());

        assert!(cache.resolve("https://x/models/", &fetcher, volume.path()).await.is_err());
        assert!(fetcher.calls().is_empty());
    }
}
