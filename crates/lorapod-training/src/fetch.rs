//! Downloading job inputs.

use crate::error::{TrainingError, TrainingResult};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Fetches a URL into a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the body of `url` to `dest`, replacing any existing file. Returns bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> TrainingResult<u64>;
}

/// Streams `http(s)` URLs to disk and copies `file://` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> TrainingResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("lorapod/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TrainingError::Download(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> TrainingResult<u64> {
        let parsed = Url::parse(url)
            .map_err(|e| TrainingError::Download(format!("invalid URL {url}: {e}")))?;

        if parsed.scheme() == "file" {
            let source = parsed
                .to_file_path()
                .map_err(|()| TrainingError::Download(format!("invalid file URL: {url}")))?;
            let bytes = tokio::fs::copy(&source, dest)
                .await
                .map_err(|e| TrainingError::Download(format!("failed to copy {}: {e}", source.display())))?;
            debug!(url, dest = %dest.display(), bytes, "copied local file");
            return Ok(bytes);
        }

        info!(url, "downloading");
        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TrainingError::Download(format!("GET {url} failed: {e}")))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TrainingError::Download(format!("reading body of {url} failed: {e}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, dest = %dest.display(), bytes = written, "download complete");
        Ok(written)
    }
}

/// Last path segment of a URL, ignoring query and fragment.
///
/// This is the model cache key and the local name of downloaded files.
pub fn url_file_name(url: &str) -> TrainingResult<String> {
    let parsed = Url::parse(url)
        .map_err(|e| TrainingError::Download(format!("invalid URL {url}: {e}")))?;

    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| TrainingError::Download(format!("URL has no file name: {url}")))
}
