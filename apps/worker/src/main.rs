//! lorapod - serverless LoRA training worker
//!
//! Runs training jobs from a file, from stdin, or from an HTTP job queue.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use commands::{run, serve, validate};

#[derive(Parser, Debug)]
#[command(
    name = "lorapod",
    author,
    version,
    about = "Serverless LoRA training worker",
    long_about = "Validates a training job, fetches the base model and image dataset, runs the trainer and publishes the adapter.\nThe job result is printed to stdout as JSON; logs go to stderr."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (skips ~/.lorapod/config.toml and ./lorapod.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single job and print its result
    Run {
        /// Job file (`-` for stdin)
        #[arg(long)]
        job: String,
    },

    /// Check a job's input without running it
    ///
    /// Exits with status 1 when the input is rejected.
    Validate {
        /// Job file (`-` for stdin)
        #[arg(long)]
        job: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll the job queue and run jobs until interrupted
    Serve,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let worker_config = config::load_config(args.config.as_deref())?;

    let level = args
        .log_level
        .clone()
        .or_else(|| worker_config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_tracing(&level)?;

    match args.command {
        Command::Run { job } => run::execute(worker_config, &job).await?,
        Command::Validate { job, json } => validate::execute(&job, json)?,
        Command::Serve => serve::execute(worker_config).await?,
    }

    Ok(())
}
