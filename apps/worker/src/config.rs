//! Worker configuration loading.

use anyhow::Context;
use lorapod_training::WorkerConfig;
use std::path::Path;

/// Load configuration.
///
/// Precedence, highest first:
/// 1. Environment variables
/// 2. `--config <path>` when given, otherwise local `./lorapod.toml`
///    layered over global `~/.lorapod/config.toml`
/// 3. Defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    let mut config = match path {
        Some(path) => WorkerConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => WorkerConfig::discover_and_load().context("failed to load configuration")?,
    };
    config.apply_env_overrides();
    Ok(config)
}
