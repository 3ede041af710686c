//! Publishing trained adapters to object storage.

use crate::artifacts::TrainingArtifact;
use crate::config::StorageSettings;
use crate::error::{TrainingError, TrainingResult};
use crate::job::BucketConfig;
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::ObjectStore;
use reqwest::Url;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const DEFAULT_REGION: &str = "us-east-1";

/// Uploads an artifact and returns a URL the client can download it from.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(
        &self,
        artifact: &TrainingArtifact,
        bucket: Option<&BucketConfig>,
    ) -> TrainingResult<String>;
}

/// Stream a local file into `store` under `key`.
pub async fn upload_file(
    store: Arc<dyn ObjectStore>,
    key: &ObjectPath,
    source: &Path,
) -> TrainingResult<u64> {
    let mut file = tokio::fs::File::open(source).await?;
    let mut writer = BufWriter::new(store, key.clone());
    let bytes = tokio::io::copy(&mut file, &mut writer)
        .await
        .map_err(|e| TrainingError::Upload(format!("failed to upload {}: {e}", source.display())))?;
    writer
        .shutdown()
        .await
        .map_err(|e| TrainingError::Upload(format!("failed to complete upload of {key}: {e}")))?;
    Ok(bytes)
}

/// Publishes into a fixed store; the returned URL is `base_url` joined with the key.
///
/// Used for the local fallback and for in-memory stores in tests.
#[derive(Debug, Clone)]
pub struct StorePublisher {
    store: Arc<dyn ObjectStore>,
    base_url: Url,
}

impl StorePublisher {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, base_url: Url) -> Self {
        Self { store, base_url }
    }

    /// A publisher writing into `dir`, handing out `file://` URLs.
    pub fn local(dir: &Path) -> TrainingResult<Self> {
        std::fs::create_dir_all(dir)?;
        let dir = std::path::absolute(dir)?;
        let store = LocalFileSystem::new_with_prefix(&dir)?;
        let base_url = Url::from_directory_path(&dir)
            .map_err(|()| TrainingError::Upload(format!("cannot express {} as a URL", dir.display())))?;
        Ok(Self::new(Arc::new(store), base_url))
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl ArtifactPublisher for StorePublisher {
    async fn publish(
        &self,
        artifact: &TrainingArtifact,
        _bucket: Option<&BucketConfig>,
    ) -> TrainingResult<String> {
        let key = ObjectPath::from(artifact.name.as_str());
        let bytes = upload_file(self.store(), &key, &artifact.path).await?;
        let url = self
            .base_url
            .join(&artifact.name)
            .map_err(|e| TrainingError::Upload(format!("invalid object URL for {}: {e}", artifact.name)))?;
        info!(key = %key, bytes, url = %url, "artifact stored");
        Ok(url.to_string())
    }
}

/// Credentials for one upload, after merging job and worker settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedBucket {
    pub endpoint_url: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket_name: String,
    pub region: String,
}

impl std::fmt::Debug for ResolvedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedBucket")
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Uploads to an S3-compatible bucket and returns a presigned GET URL.
///
/// Falls back to [`StorePublisher::local`] when no endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct BucketPublisher {
    settings: StorageSettings,
}

impl BucketPublisher {
    #[must_use]
    pub fn new(settings: StorageSettings) -> Self {
        Self { settings }
    }

    /// Merge per-job credentials over the worker settings, field by field.
    ///
    /// Returns `None` when neither supplies an endpoint.
    #[must_use]
    pub fn resolve(&self, job: Option<&BucketConfig>) -> Option<ResolvedBucket> {
        let pick = |from_job: Option<&Option<String>>, fallback: &Option<String>| {
            from_job
                .and_then(Option::as_ref)
                .or(fallback.as_ref())
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let s = &self.settings;

        let endpoint_url = pick(job.map(|b| &b.endpoint_url), &s.endpoint_url)?;
        let bucket_name = pick(job.map(|b| &b.bucket_name), &s.default_bucket)
            .unwrap_or_else(current_month_bucket);
        let region = pick(job.map(|b| &b.region), &s.region).unwrap_or_else(|| DEFAULT_REGION.to_string());

        Some(ResolvedBucket {
            endpoint_url,
            access_key_id: pick(job.map(|b| &b.access_id), &s.access_key_id),
            secret_access_key: pick(job.map(|b| &b.access_secret), &s.secret_access_key),
            bucket_name,
            region,
        })
    }

    fn build_store(bucket: &ResolvedBucket) -> TrainingResult<object_store::aws::AmazonS3> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(&bucket.endpoint_url)
            .with_bucket_name(&bucket.bucket_name)
            .with_region(&bucket.region)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(bucket.endpoint_url.starts_with("http://"));
        if let Some(key) = &bucket.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &bucket.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        builder
            .build()
            .map_err(|e| TrainingError::Upload(format!("invalid bucket configuration: {e}")))
    }
}

#[async_trait]
impl ArtifactPublisher for BucketPublisher {
    async fn publish(
        &self,
        artifact: &TrainingArtifact,
        bucket: Option<&BucketConfig>,
    ) -> TrainingResult<String> {
        let Some(resolved) = self.resolve(bucket) else {
            info!(
                dir = %self.settings.local_fallback_dir.display(),
                "no bucket endpoint configured, storing artifact locally"
            );
            return StorePublisher::local(&self.settings.local_fallback_dir)?
                .publish(artifact, bucket)
                .await;
        };
        debug!(bucket = ?resolved, "resolved bucket");

        let store = Arc::new(Self::build_store(&resolved)?);
        let key = ObjectPath::from(artifact.name.as_str());

        info!(
            bucket = %resolved.bucket_name,
            key = %key,
            size_bytes = artifact.size_bytes,
            "uploading artifact"
        );
        upload_file(store.clone(), &key, &artifact.path).await?;

        let expires = Duration::from_secs(self.settings.presign_expiry_secs);
        let url = store
            .signed_url(http::Method::GET, &key, expires)
            .await
            .map_err(|e| TrainingError::Upload(format!("failed to presign {key}: {e}")))?;

        info!(bucket = %resolved.bucket_name, key = %key, "artifact uploaded");
        Ok(url.to_string())
    }
}

/// Bucket used when none is named: the current month as `MM-YY`.
#[must_use]
pub fn current_month_bucket() -> String {
    chrono::Utc::now().format("%m-%y").to_string()
}
