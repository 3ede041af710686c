use anyhow::Context;
use lorapod_training::{JobHandler, WorkerConfig};
use tracing::info;

/// Execute the run command.
///
/// Prints the job result as JSON. Rejected input is a result, not a failure.
pub async fn execute(config: WorkerConfig, job_source: &str) -> anyhow::Result<()> {
    let job = super::read_job(job_source)?;
    info!(job_id = %job.id, "running job");

    let handler = JobHandler::from_config(config).context("failed to set up job handler")?;
    let result = handler.handle(&job).await.with_context(|| format!("job {} failed", job.id))?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
