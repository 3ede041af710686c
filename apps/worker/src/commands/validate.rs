//! Job input validation command.

use colored::Colorize;
use lorapod_training::{validate_job_input, JobInput, TrainingError};
use serde_json::json;

/// Execute the validate command.
///
/// Exits with status 1 if the input is rejected.
pub fn execute(job_source: &str, json: bool) -> anyhow::Result<()> {
    let job = super::read_job(job_source)?;

    match validate_job_input(&job.input) {
        Ok(input) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&json!({"valid": true, "input": input}))?);
            } else {
                output_valid(&job.id.to_string(), &input);
            }
            Ok(())
        }
        Err(TrainingError::Validation(errors)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&json!({"valid": false, "error": errors}))?);
            } else {
                println!("{} job {} input is invalid", "✗".red().bold(), job.id);
                for error in &errors {
                    println!("  - {}", error);
                }
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn output_valid(job_id: &str, input: &JobInput) {
    println!("{} job {} input is valid", "✓".green().bold(), job_id);
    println!();
    println!("  {:<14} {}", "model".dimmed(), input.model_url);
    println!("  {:<14} {}", "dataset".dimmed(), input.zip_url);
    println!("  {:<14} {}", "image folder".dimmed(), input.image_folder_name());
    println!("  {:<14} {}", "output".dimmed(), input.output_name(&job_id.into()));
    println!(
        "  {:<14} {} steps, batch {}, lr {}",
        "schedule".dimmed(),
        input.max_train_steps,
        input.train_batch_size,
        input.learning_rate
    );
}
