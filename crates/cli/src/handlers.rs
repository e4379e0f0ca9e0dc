// Demo job types available to pipelines run from the command line

use kiln_core::{JobConfig, JobContext, JobError, OrchestratorBuilder};
use serde_json::{json, Value};
use std::time::Duration;

/// `echo`: returns the job's config as its output
async fn echo(job: JobConfig, ctx: JobContext) -> Result<Value, JobError> {
    ctx.log(format!("Echoing config of {}", job.id));
    Ok(job.config)
}

/// `sleep`: waits `config.ms` milliseconds, stopping early if the execution is cancelled
async fn sleep(job: JobConfig, ctx: JobContext) -> Result<Value, JobError> {
    let ms = match job.config.get("ms") {
        None => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| JobError::invalid_config("sleep: 'ms' must be a non-negative integer"))?,
    };

    ctx.log(format!("Sleeping for {ms}ms"));
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        _ = ctx.cancelled() => return Err(JobError::Cancelled),
    }
    ctx.update_progress(100).await;

    Ok(json!({ "sleptMs": ms }))
}

pub fn register(builder: OrchestratorBuilder) -> OrchestratorBuilder {
    builder.handler_fn("echo", echo).handler_fn("sleep", sleep)
}
