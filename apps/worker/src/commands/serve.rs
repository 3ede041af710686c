//! Queue worker loop.

use anyhow::Context;
use lorapod_training::{Job, JobHandler, JobId, JobResult, QueueSettings, TrainingResult, WorkerConfig};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// HTTP client for the job queue.
#[derive(Debug, Clone)]
pub struct QueueClient {
    client: Client,
    take_url: String,
    done_url: String,
    api_key: Option<String>,
}

impl QueueClient {
    pub fn from_settings(settings: &QueueSettings) -> anyhow::Result<Self> {
        let take_url = settings
            .take_url
            .clone()
            .context("queue.take_url is not configured (set LORAPOD_QUEUE_TAKE_URL)")?;
        let done_url = settings
            .done_url
            .clone()
            .context("queue.done_url is not configured (set LORAPOD_QUEUE_DONE_URL)")?;
        let client = Client::builder()
            .user_agent(concat!("lorapod/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client, take_url, done_url, api_key: settings.api_key.clone() })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Take the next job, if any.
    pub async fn take(&self) -> anyhow::Result<Option<Job>> {
        let response = self
            .authorized(self.client.get(&self.take_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("failed to poll job queue")?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await.context("failed to read job from queue")?;
        parse_job_body(&body)
    }

    /// Report a job outcome.
    pub async fn done(&self, job_id: &JobId, body: &Value) -> anyhow::Result<()> {
        let url = self.done_url_for(job_id);
        self.authorized(self.client.post(&url))
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed to report job {job_id}"))?;
        Ok(())
    }

    pub fn done_url_for(&self, job_id: &JobId) -> String {
        self.done_url.replace("$ID", job_id.as_str())
    }
}

/// `None` for an empty body.
pub fn parse_job_body(body: &[u8]) -> anyhow::Result<Option<Job>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let job = serde_json::from_slice(body).context("queue returned a malformed job")?;
    Ok(Some(job))
}

/// Body posted to the done URL.
pub fn completion_body(outcome: &TrainingResult<JobResult>) -> Value {
    match outcome {
        Ok(result) => json!({ "output": result }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Execute the serve command.
///
/// Jobs run one at a time. Ctrl-C stops the loop once the current job is done.
pub async fn execute(config: WorkerConfig) -> anyhow::Result<()> {
    let queue = QueueClient::from_settings(&config.queue)?;
    let poll_interval = Duration::from_secs(config.queue.poll_interval_secs.max(1));
    let handler = JobHandler::from_config(config).context("failed to set up job handler")?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested, finishing current job");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                // Keep the sender alive so `changed()` never resolves.
                std::future::pending::<()>().await;
            }
        }
    });

    info!(take_url = %queue.take_url, "waiting for jobs");
    while !*stop_rx.borrow() {
        let job = match queue.take().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                idle(&mut stop_rx, poll_interval).await;
                continue;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "job poll failed");
                idle(&mut stop_rx, poll_interval).await;
                continue;
            }
        };

        info!(job_id = %job.id, "job taken");
        let outcome = handler.handle(&job).await;
        if let Err(e) = &outcome {
            error!(job_id = %job.id, error = %e, "job failed");
        }

        if let Err(e) = queue.done(&job.id, &completion_body(&outcome)).await {
            error!(job_id = %job.id, error = %format!("{e:#}"), "could not report job outcome");
        }
    }

    info!("worker stopped");
    Ok(())
}

async fn idle(stop_rx: &mut watch::Receiver<bool>, interval: Duration) {
    tokio::select! {
        () = tokio::time::sleep(interval) => {}
        _ = stop_rx.changed() => {}
    }
}
