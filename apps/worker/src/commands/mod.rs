//! Command implementations for the lorapod worker.

pub mod run;
pub mod serve;
pub mod validate;

use anyhow::Context;
use lorapod_training::Job;
use std::io::Read;

/// Read a job envelope from a file, or from stdin when `source` is `-`.
pub fn read_job(source: &str) -> anyhow::Result<Job> {
    let content = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("failed to read job from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read job file {source}"))?
    };

    serde_json::from_str(&content).with_context(|| format!("failed to parse job from {source}"))
}
