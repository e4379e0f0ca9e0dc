use super::cache::{fingerprint, ResultCache};
use super::context::{ExecutionState, JobCompleteCallback, JobContext, ProgressCallback};
use super::registry::JobHandler;
use crate::error::JobError;
use crate::types::{JobConfig, JobStatus, LogLine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Per-dispatch settings taken from the submission options
#[derive(Clone, Default)]
pub(crate) struct DispatchSettings {
    pub enable_cache: bool,
    pub force_rerun: bool,
    pub on_progress: Option<ProgressCallback>,
    pub on_job_complete: Option<JobCompleteCallback>,
}

/// Runs a single job: cache lookup, timeout guard, retry with backoff
pub(crate) struct StepExecutor {
    cache: Option<Arc<dyn ResultCache>>,
}

impl StepExecutor {
    pub fn new(cache: Option<Arc<dyn ResultCache>>) -> Self {
        Self { cache }
    }

    /// Execute a job to a terminal status and return its outcome
    pub async fn execute(
        &self,
        execution: &Arc<ExecutionState>,
        job: &JobConfig,
        handler: Arc<dyn JobHandler>,
        settings: &DispatchSettings,
    ) -> Result<serde_json::Value, JobError> {
        if !self.try_start(execution, job) {
            return Err(JobError::Cancelled);
        }

        let use_cache = settings.enable_cache && handler.cacheable() && self.cache.is_some();
        let key = use_cache.then(|| fingerprint(&job.job_type, &job.config));

        if let (Some(key), false) = (&key, settings.force_rerun) {
            if let Some(output) = self.cached_output(job, key).await {
                execution.update_job(&job.id, |state| {
                    state.from_cache = true;
                    push_log(state, format!("Restored output from cache ({})", &key[..12]));
                });
                self.finish(execution, job, JobStatus::Completed, Some(output.clone()), None, settings);
                return Ok(output);
            }
        }

        let retry = job.retry_config.clone().unwrap_or_default();
        let max_attempts = retry.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            execution.update_job(&job.id, |state| state.attempts = attempt);

            let ctx = JobContext::new(
                execution.clone(),
                job.id.clone(),
                attempt,
                settings.on_progress.clone(),
            );

            tracing::info!(
                "Executing job {} (attempt {}/{}) for execution {}",
                job.id,
                attempt,
                max_attempts,
                execution.id
            );
            ctx.log(format!("Starting attempt {attempt}/{max_attempts}"));

            let error = match self.run_attempt(job, &handler, &ctx).await {
                Ok(output) => {
                    if let Some(key) = &key {
                        self.store_output(job, key, &output).await;
                    }
                    ctx.log("Completed");
                    self.finish(execution, job, JobStatus::Completed, Some(output.clone()), None, settings);
                    return Ok(output);
                }
                Err(error) => error,
            };

            ctx.log(format!("Attempt {attempt} failed: {error}"));

            if execution.is_cancelled() {
                return self.fail_cancelled(execution, job, error, settings);
            }

            if !error.is_retryable() || attempt >= max_attempts {
                tracing::warn!("Job {} failed permanently: {}", job.id, error);
                self.finish(execution, job, JobStatus::Failed, None, Some(error.clone()), settings);
                return Err(error);
            }

            let delay = retry.delay_after_attempt(attempt);
            tracing::info!(
                "Retrying job {} after {:?} (attempt {})",
                job.id,
                delay,
                attempt + 1
            );
            ctx.log(format!("Retrying in {}ms", delay.as_millis()));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => {
                    return self.fail_cancelled(execution, job, error, settings);
                }
            }
        }
    }

    /// Fail a job that could not be dispatched at all
    pub(crate) fn reject(
        &self,
        execution: &ExecutionState,
        job: &JobConfig,
        error: JobError,
        settings: &DispatchSettings,
    ) {
        tracing::error!("Job {} could not be dispatched: {}", job.id, error);
        self.finish(execution, job, JobStatus::Failed, None, Some(error), settings);
    }

    /// Move the job from pending to running unless it was cancelled meanwhile
    fn try_start(&self, execution: &ExecutionState, job: &JobConfig) -> bool {
        if execution.is_cancelled() {
            execution.cancel_pending("Execution cancelled before dispatch");
            return false;
        }

        execution
            .update_job(&job.id, |state| {
                if state.status != JobStatus::Pending {
                    return false;
                }
                state.status = JobStatus::Running;
                state.started_at = Some(Utc::now());
                true
            })
            .unwrap_or(false)
    }

    /// One handler invocation, raced against the job's timeout
    async fn run_attempt(
        &self,
        job: &JobConfig,
        handler: &Arc<dyn JobHandler>,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, JobError> {
        let task = tokio::spawn({
            let handler = handler.clone();
            let job = job.clone();
            let ctx = ctx.clone();
            async move { handler.execute(&job, &ctx).await }
        });
        let abort = task.abort_handle();

        let joined = match job.timeout_ms {
            Some(timeout_ms) => match timeout(Duration::from_millis(timeout_ms), task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Stop waiting and drop the handler future
                    abort.abort();
                    tracing::warn!("Job {} timed out after {}ms", job.id, timeout_ms);
                    return Err(JobError::Timeout { timeout_ms });
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                tracing::error!("Handler for job {} panicked", job.id);
                Err(JobError::handler("handler panicked"))
            }
            Err(_) => Err(JobError::Cancelled),
        }
    }

    async fn cached_output(&self, job: &JobConfig, key: &str) -> Option<serde_json::Value> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => {
                tracing::debug!("Cache {} for job {}", if hit.is_some() { "hit" } else { "miss" }, job.id);
                hit
            }
            Err(e) => {
                tracing::warn!("Cache lookup failed for job {}: {:#}", job.id, e);
                None
            }
        }
    }

    async fn store_output(&self, job: &JobConfig, key: &str, output: &serde_json::Value) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, output).await {
                tracing::warn!("Failed to cache output of job {}: {:#}", job.id, e);
            }
        }
    }

    fn fail_cancelled(
        &self,
        execution: &ExecutionState,
        job: &JobConfig,
        error: JobError,
        settings: &DispatchSettings,
    ) -> Result<serde_json::Value, JobError> {
        tracing::info!("Job {} stopped by cancellation", job.id);
        self.finish(execution, job, JobStatus::Cancelled, None, Some(error), settings);
        Err(JobError::Cancelled)
    }

    fn finish(
        &self,
        execution: &ExecutionState,
        job: &JobConfig,
        status: JobStatus,
        output: Option<serde_json::Value>,
        error: Option<JobError>,
        settings: &DispatchSettings,
    ) {
        let final_state = execution.update_job(&job.id, |state| {
            state.status = status;
            state.output = output;
            state.error = error;
            state.completed_at = Some(Utc::now());
            if status == JobStatus::Completed {
                state.progress = 100;
            }
            state.clone()
        });

        if let (Some(callback), Some(state)) = (&settings.on_job_complete, final_state) {
            callback(&state);
        }
    }
}

fn push_log(state: &mut crate::types::JobExecutionState, message: String) {
    state.logs.push(LogLine {
        timestamp: Utc::now(),
        message,
    });
}
