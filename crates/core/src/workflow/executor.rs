use super::cache::ResultCache;
use super::context::{
    ExecutionState, JobCompleteCallback, JobContext, ProgressCallback, ProgressEvent,
};
use super::dag::{self, JobDag, ValidationReport};
use super::expansion::expand_fan_outs;
use super::registry::{handler_fn, HandlerRegistry, JobHandler};
use super::step_executor::{DispatchSettings, StepExecutor};
use crate::approval::{ApprovalHandler, ApprovalManager};
use crate::config::OrchestratorConfig;
use crate::error::{JobError, OrchestratorError, ValidationIssue};
use crate::parallel::{CustomAggregator, FanInHandler, FanOutHandler};
use crate::types::{
    Execution, ExecutionId, ExecutionStatus, JobConfig, JobExecutionState, JobId, JobStatus, JobType,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

/// Per-submission options
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Max concurrent jobs within a level; defaults to the level size
    pub parallelism: Option<usize>,
    /// Overrides `execution.enable_cache` from the configuration
    pub enable_cache: Option<bool>,
    pub force_rerun: bool,
    pub on_job_complete: Option<JobCompleteCallback>,
    pub on_progress: Option<ProgressCallback>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn enable_cache(mut self, enable: bool) -> Self {
        self.enable_cache = Some(enable);
        self
    }

    pub fn force_rerun(mut self, force: bool) -> Self {
        self.force_rerun = force;
        self
    }

    pub fn on_job_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobExecutionState) + Send + Sync + 'static,
    {
        self.on_job_complete = Some(Arc::new(f));
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

struct ExecutionRecord {
    state: Arc<ExecutionState>,
    jobs: Vec<JobConfig>,
}

/// Runs pipelines level by level and keeps every execution it started.
///
/// Finished executions stay queryable through [`Orchestrator::get_execution`]
/// until [`Orchestrator::forget_execution`] drops them; nothing is evicted
/// automatically, so long-lived callers should forget what they no longer need.
pub struct Orchestrator {
    registry: Arc<HandlerRegistry>,
    step_executor: Arc<StepExecutor>,
    config: OrchestratorConfig,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionRecord>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Structural validation plus handler lookup and per-handler config checks
    pub fn validate_pipeline(&self, jobs: &[JobConfig]) -> ValidationReport {
        let mut report = dag::validate(jobs);

        for job in jobs {
            match self.registry.get(&job.job_type) {
                None => report.errors.push(ValidationIssue::UnknownJobType {
                    job_id: job.id.clone(),
                    job_type: job.job_type.to_string(),
                }),
                Some(handler) => {
                    if let Err(message) = handler.validate(job) {
                        report.errors.push(ValidationIssue::InvalidConfig {
                            job_id: job.id.clone(),
                            message,
                        });
                    }
                }
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    /// Synthesise fan-out children, then execute the expanded graph
    pub async fn execute_expanded(
        &self,
        pipeline_name: &str,
        jobs: Vec<JobConfig>,
        options: ExecuteOptions,
    ) -> Result<Execution, OrchestratorError> {
        let expanded = expand_fan_outs(&jobs).map_err(OrchestratorError::Validation)?;
        self.execute(pipeline_name, expanded, options).await
    }

    /// Execute a pipeline to completion
    pub async fn execute(
        &self,
        pipeline_name: &str,
        jobs: Vec<JobConfig>,
        options: ExecuteOptions,
    ) -> Result<Execution, OrchestratorError> {
        let report = self.validate_pipeline(&jobs);
        if !report.valid {
            tracing::warn!(
                "Rejected pipeline {}: {} validation issue(s)",
                pipeline_name,
                report.errors.len()
            );
            return Err(OrchestratorError::Validation(report.errors));
        }

        let levels: Vec<Vec<JobConfig>> = JobDag::from_jobs(&jobs)
            .map_err(OrchestratorError::Validation)?
            .levels()
            .into_iter()
            .map(|level| level.into_iter().cloned().collect())
            .collect();

        let state = Arc::new(ExecutionState::new(pipeline_name, &jobs));
        let execution_id = state.id;
        self.executions.write().await.insert(
            execution_id,
            Arc::new(ExecutionRecord {
                state: state.clone(),
                jobs,
            }),
        );

        tracing::info!(
            "Starting execution {} of pipeline {} ({} levels)",
            execution_id,
            pipeline_name,
            levels.len()
        );

        let settings = DispatchSettings {
            enable_cache: options
                .enable_cache
                .unwrap_or(self.config.execution.enable_cache),
            force_rerun: options.force_rerun,
            on_progress: options.on_progress.clone(),
            on_job_complete: options.on_job_complete.clone(),
        };
        let parallelism = options
            .parallelism
            .or(self.config.execution.default_parallelism);

        for (depth, level) in levels.into_iter().enumerate() {
            if state.is_cancelled() {
                break;
            }

            tracing::debug!(
                "Dispatching level {} of execution {} ({} jobs)",
                depth,
                execution_id,
                level.len()
            );

            if let Some((job_id, error)) = self
                .run_level(&state, level, parallelism, &settings)
                .await
            {
                if state.is_cancelled() {
                    break;
                }

                state.cancel_pending(&format!("Cancelled: upstream failure in job {job_id}"));
                state.finish(ExecutionStatus::Failed).await;
                tracing::error!(
                    "Execution {} failed: job {} failed: {}",
                    execution_id,
                    job_id,
                    error
                );

                return Err(OrchestratorError::JobFailed {
                    job_id,
                    error,
                    execution: Box::new(state.snapshot().await),
                });
            }
        }

        if state.is_cancelled() || !state.finish(ExecutionStatus::Completed).await {
            state.cancel_pending("Cancelled: execution cancelled");
            tracing::info!("Execution {} cancelled", execution_id);
            return Err(OrchestratorError::Cancelled {
                execution: Box::new(state.snapshot().await),
            });
        }

        tracing::info!("Execution {} completed", execution_id);
        Ok(state.snapshot().await)
    }

    /// Run one level to quiescence. Returns the first failure in input order.
    async fn run_level(
        &self,
        state: &Arc<ExecutionState>,
        level: Vec<JobConfig>,
        parallelism: Option<usize>,
        settings: &DispatchSettings,
    ) -> Option<(JobId, JobError)> {
        let permits = parallelism.unwrap_or(level.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut groups: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut handles = Vec::with_capacity(level.len());

        for job in level {
            let group = job.concurrency_limit.as_ref().map(|limit| {
                groups
                    .entry(limit.group.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(limit.max.max(1))))
                    .clone()
            });
            let handler = self.registry.get(&job.job_type);
            let step_executor = self.step_executor.clone();
            let semaphore = semaphore.clone();
            let state = state.clone();
            let settings = settings.clone();
            let job_id = job.id.clone();

            let handle = tokio::spawn(async move {
                // Group permit first so a throttled group never pins level permits
                let _group_permit = match group {
                    Some(group) => Some(group.acquire_owned().await.map_err(|_| JobError::Cancelled)?),
                    None => None,
                };
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::Cancelled)?;

                let Some(handler) = handler else {
                    let error = JobError::NoHandler {
                        job_type: job.job_type.to_string(),
                    };
                    step_executor.reject(&state, &job, error.clone(), &settings);
                    return Err(error);
                };

                step_executor.execute(&state, &job, handler, &settings).await
            });
            handles.push((job_id, handle));
        }

        let mut first_failure = None;
        for (job_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(JobError::handler(format!("dispatch task failed: {e}"))),
            };

            if let Err(error) = outcome {
                if first_failure.is_none() && error != JobError::Cancelled {
                    first_failure = Some((job_id, error));
                }
            }
        }
        first_failure
    }

    /// Cancel a running execution. Returns false if it is unknown or already finished.
    pub async fn cancel(&self, execution_id: ExecutionId) -> bool {
        let Some(record) = self.executions.read().await.get(&execution_id).cloned() else {
            tracing::debug!("Cancel requested for unknown execution {}", execution_id);
            return false;
        };

        if !record.state.finish(ExecutionStatus::Cancelled).await {
            return false;
        }

        // Snapshot before signalling: a handler that observes the signal
        // moves its job out of `running` before `on_cancel` could reach it
        let running = record.state.job_ids_with_status(JobStatus::Running);
        record.state.signal_cancel();
        tracing::info!("Cancellation signal sent for execution {}", execution_id);

        let reason = "Execution cancelled";
        for job_id in running {
            let Some(job) = record.jobs.iter().find(|job| job.id == job_id) else {
                continue;
            };
            if let Some(handler) = self.registry.get(&job.job_type) {
                handler.on_cancel(job, execution_id, reason).await;
            }
        }

        record.state.cancel_pending("Cancelled: execution cancelled");
        true
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Option<Execution> {
        let record = self.executions.read().await.get(&execution_id).cloned()?;
        Some(record.state.snapshot().await)
    }

    /// Snapshots of every known execution, oldest first
    pub async fn list_executions(&self) -> Vec<Execution> {
        let records: Vec<Arc<ExecutionRecord>> =
            self.executions.read().await.values().cloned().collect();

        let mut executions = Vec::with_capacity(records.len());
        for record in records {
            executions.push(record.state.snapshot().await);
        }
        executions.sort_by_key(|execution| execution.started_at);
        executions
    }

    /// Drop a finished execution from the map. Running executions are kept.
    pub async fn forget_execution(&self, execution_id: ExecutionId) -> bool {
        let mut executions = self.executions.write().await;
        let Some(record) = executions.get(&execution_id) else {
            return false;
        };
        if record.state.status().await == ExecutionStatus::Running {
            return false;
        }
        executions.remove(&execution_id).is_some()
    }
}

/// Configures handlers and collaborators, then freezes them into an [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    handlers: Vec<(JobType, Arc<dyn JobHandler>)>,
    cache: Option<Arc<dyn ResultCache>>,
    approvals: Option<Arc<ApprovalManager>>,
    aggregators: HashMap<String, CustomAggregator>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, job_type: impl Into<JobType>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((job_type.into(), handler));
        self
    }

    pub fn handler_fn<F, Fut>(self, job_type: impl Into<JobType>, f: F) -> Self
    where
        F: Fn(JobConfig, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
    {
        self.handler(job_type, handler_fn(f))
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach an approval manager; enables the `approval` job type
    pub fn approvals(mut self, manager: Arc<ApprovalManager>) -> Self {
        self.approvals = Some(manager);
        self
    }

    /// Named aggregator for fan-in jobs using the `custom` strategy
    pub fn aggregator<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[serde_json::Value]) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.aggregators.insert(name.into(), Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut registry = HandlerRegistry::new();

        for (job_type, handler) in self.handlers {
            if job_type.is_reserved() {
                return Err(OrchestratorError::ReservedHandlerType(job_type.to_string()));
            }
            registry.register(job_type, handler);
        }

        registry.register(JobType::FanOut, Arc::new(FanOutHandler));
        registry.register(JobType::FanIn, Arc::new(FanInHandler::new(self.aggregators)));
        if let Some(manager) = self.approvals {
            let settings = manager.settings().clone();
            registry.register(
                JobType::Approval,
                Arc::new(ApprovalHandler::new(manager, settings)),
            );
        }

        tracing::debug!("Registered job types: {:?}", registry.job_types());

        Ok(Orchestrator {
            registry: Arc::new(registry),
            step_executor: Arc::new(StepExecutor::new(self.cache)),
            config: self.config,
            executions: RwLock::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalFilter, ApproveInput, RejectInput};
    use crate::config::ApprovalSettings;
    use crate::types::{ApprovalRequest, ApprovalStatus, RetryConfig};
    use crate::workflow::cache::InMemoryResultCache;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn echo() -> OrchestratorBuilder {
        Orchestrator::builder().handler_fn("echo", |job, _ctx| async move { Ok(job.config) })
    }

    fn job(id: &str, job_type: &str, deps: &[&str]) -> JobConfig {
        JobConfig::new(id, id, job_type).with_dependencies(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_linear_pipeline_completes() {
        let orchestrator = echo()
            .handler_fn("sum", |job, ctx| async move {
                let deps: Vec<i64> = job
                    .depends_on
                    .iter()
                    .filter_map(|dep| ctx.job_output(dep.as_str()))
                    .filter_map(|out| out["n"].as_i64())
                    .collect();
                Ok(json!({"n": deps.iter().sum::<i64>()}))
            })
            .build()
            .unwrap();

        let jobs = vec![
            job("a", "echo", &[]).with_config(json!({"n": 2})),
            job("b", "echo", &[]).with_config(json!({"n": 3})),
            job("total", "sum", &["a", "b"]),
        ];

        let execution = orchestrator
            .execute("sum", jobs, ExecuteOptions::new())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output("total"), Some(&json!({"n": 5})));
        assert!(execution.completed_at.is_some());
        for state in execution.jobs.values() {
            assert_eq!(state.status, JobStatus::Completed);
            assert_eq!(state.attempts, 1);
            assert_eq!(state.progress, 100);
        }
    }

    #[tokio::test]
    async fn test_validation_failure_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orchestrator = Orchestrator::builder()
            .handler_fn("task", move |_job, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })
            .build()
            .unwrap();

        let jobs = vec![
            job("a", "task", &["b"]),
            job("b", "task", &["a"]),
            job("c", "mystery", &["ghost"]),
        ];
        let err = orchestrator
            .execute("bad", jobs, ExecuteOptions::new())
            .await
            .unwrap_err();

        let OrchestratorError::Validation(issues) = err else {
            panic!("expected validation error");
        };
        assert!(issues.contains(&ValidationIssue::MissingDependency {
            job_id: JobId::new("c"),
            dependency: JobId::new("ghost"),
        }));
        assert!(issues.contains(&ValidationIssue::UnknownJobType {
            job_id: JobId::new("c"),
            job_type: "mystery".to_string(),
        }));
        assert!(issues
            .iter()
            .any(|issue| matches!(issue, ValidationIssue::Cycle { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(orchestrator.list_executions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_bounds_concurrent_jobs() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (active.clone(), peak.clone());

        let orchestrator = Orchestrator::builder()
            .handler_fn("work", move |_job, _ctx| {
                let active = active_c.clone();
                let peak = peak_c.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .build()
            .unwrap();

        let jobs: Vec<JobConfig> = (0..6).map(|i| job(&format!("w{i}"), "work", &[])).collect();
        let started = tokio::time::Instant::now();
        orchestrator
            .execute("wide", jobs, ExecuteOptions::new().parallelism(2))
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_runs_fully_parallel_by_default() {
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (active.clone(), peak.clone());
        let orchestrator = Orchestrator::builder()
            .handler_fn("work", move |_job, _ctx| {
                let active = active_c.clone();
                let peak = peak_c.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .build()
            .unwrap();

        let jobs: Vec<JobConfig> = (0..5).map(|i| job(&format!("w{i}"), "work", &[])).collect();
        orchestrator
            .execute("wide", jobs, ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failure_stops_later_levels() {
        let orchestrator = echo()
            .handler_fn("fail", |_job, _ctx| async {
                Err(JobError::handler("disk full"))
            })
            .build()
            .unwrap();

        let jobs = vec![
            job("ok", "echo", &[]).with_config(json!({"v": 1})),
            job("broken", "fail", &[]),
            job("after", "echo", &["ok", "broken"]),
            job("later", "echo", &["after"]),
        ];

        let err = orchestrator
            .execute("fails", jobs, ExecuteOptions::new())
            .await
            .unwrap_err();

        let OrchestratorError::JobFailed {
            job_id,
            error,
            execution,
        } = err
        else {
            panic!("expected job failure");
        };
        assert_eq!(job_id, JobId::new("broken"));
        assert_eq!(error, JobError::handler("disk full"));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.job("ok").unwrap().status, JobStatus::Completed);
        assert_eq!(execution.output("ok"), Some(&json!({"v": 1})));
        assert_eq!(execution.job("broken").unwrap().status, JobStatus::Failed);
        assert_eq!(execution.job("after").unwrap().status, JobStatus::Cancelled);
        assert_eq!(execution.job("later").unwrap().status, JobStatus::Cancelled);
        assert_eq!(execution.job("after").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_first_failure_in_input_order_is_surfaced() {
        let orchestrator = Orchestrator::builder()
            .handler_fn("fail", |job: JobConfig, _ctx| async move {
                Err(JobError::handler(format!("{} failed", job.id)))
            })
            .build()
            .unwrap();

        let jobs = vec![job("first", "fail", &[]), job("second", "fail", &[])];
        let err = orchestrator
            .execute("p", jobs, ExecuteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::JobFailed { ref job_id, .. } if job_id.as_str() == "first"
        ));
        let execution = err.execution().unwrap();
        assert_eq!(execution.job("second").unwrap().status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_dependents() {
        let orchestrator = Arc::new(
            Orchestrator::builder()
                .handler_fn("slow", |_job, _ctx| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(json!("done"))
                })
                .build()
                .unwrap(),
        );

        let jobs = vec![job("train", "slow", &[]), job("deploy", "slow", &["train"])];
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .execute("cancel-me", jobs, ExecuteOptions::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let execution_id = orchestrator.list_executions().await[0].id;
        assert!(orchestrator.cancel(execution_id).await);
        assert!(!orchestrator.cancel(execution_id).await);

        let err = running.await.unwrap().unwrap_err();
        let OrchestratorError::Cancelled { execution } = err else {
            panic!("expected cancellation");
        };
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        // Running handlers finish on their own
        assert_eq!(execution.job("train").unwrap().status, JobStatus::Completed);
        assert_eq!(execution.job("deploy").unwrap().status, JobStatus::Cancelled);

        let stored = orchestrator.get_execution(execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let orchestrator = echo().build().unwrap();
        assert!(!orchestrator.cancel(ExecutionId::new()).await);
    }

    #[tokio::test]
    async fn test_reserved_handler_types_rejected() {
        let err = Orchestrator::builder()
            .handler_fn("fan-out", |_job, _ctx| async { Ok(json!(null)) })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::ReservedHandlerType(ref t) if t == "fan-out"));

        let orchestrator = echo().build().unwrap();
        assert_eq!(orchestrator.registry().job_types(), vec!["echo", "fan-in", "fan-out"]);
    }

    #[tokio::test]
    async fn test_callbacks_receive_terminal_states() {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(AtomicUsize::new(0));
        let (sink, counter) = (completed.clone(), events.clone());

        let orchestrator = Orchestrator::builder()
            .handler_fn("chatty", |_job, ctx| async move {
                ctx.log("working");
                ctx.update_progress(50).await;
                Ok(json!(null))
            })
            .build()
            .unwrap();

        let options = ExecuteOptions::new()
            .on_job_complete(move |state| {
                sink.lock().unwrap().push((state.job_id.clone(), state.status));
            })
            .on_progress(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        orchestrator
            .execute("p", vec![job("a", "chatty", &[]), job("b", "chatty", &["a"])], options)
            .await
            .unwrap();

        let completed = completed.lock().unwrap();
        assert_eq!(
            *completed,
            vec![
                (JobId::new("a"), JobStatus::Completed),
                (JobId::new("b"), JobStatus::Completed)
            ]
        );
        // Attempt banner, "working", progress and "Completed" per job
        assert_eq!(events.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_cache_shared_across_executions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orchestrator = Orchestrator::builder()
            .cache(Arc::new(InMemoryResultCache::new()))
            .handler_fn("train", move |_job, _ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!({"run": n})) }
            })
            .build()
            .unwrap();

        let jobs = || vec![job("train", "train", &[]).with_config(json!({"lr": 0.1}))];
        let options = ExecuteOptions::new().enable_cache(true);

        orchestrator.execute("p", jobs(), options.clone()).await.unwrap();
        let second = orchestrator.execute("p", jobs(), options.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.job("train").unwrap().from_cache);
        assert_eq!(second.output("train"), Some(&json!({"run": 0})));

        // Without the flag the cache is ignored
        orchestrator.execute("p", jobs(), ExecuteOptions::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_inside_pipeline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let orchestrator = Orchestrator::builder()
            .handler_fn("flaky", move |_job, _ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(JobError::handler("not yet"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            })
            .build()
            .unwrap();

        let jobs = vec![job("a", "flaky", &[]).with_retry(RetryConfig::new(2, 100, 2.0))];
        let execution = orchestrator.execute("p", jobs, ExecuteOptions::new()).await.unwrap();
        assert_eq!(execution.job("a").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_forget_finished_execution() {
        let orchestrator = echo().build().unwrap();
        let execution = orchestrator
            .execute("p", vec![job("a", "echo", &[])], ExecuteOptions::new())
            .await
            .unwrap();

        assert_eq!(orchestrator.list_executions().await.len(), 1);
        assert!(orchestrator.forget_execution(execution.id).await);
        assert!(orchestrator.get_execution(execution.id).await.is_none());
        assert!(!orchestrator.forget_execution(execution.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_and_fan_in_end_to_end() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_c, peak_c) = (active.clone(), peak.clone());

        let orchestrator = Orchestrator::builder()
            .handler_fn("train", move |job, _ctx| {
                let active = active_c.clone();
                let peak = peak_c.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let lr: f64 = job.config["lr"].as_str().unwrap_or("0").parse().unwrap_or_default();
                    Ok(json!({"lr": lr, "accuracy": 1.0 - lr}))
                }
            })
            .build()
            .unwrap();

        let jobs = vec![
            JobConfig::new("sweep", "Sweep", JobType::FanOut).with_config(json!({
                "parameters": [{"name": "lr", "values": [0.1, 0.01, 0.001]}],
                "template": {
                    "namePattern": "train lr=${lr}",
                    "type": "train",
                    "config": {"lr": "${lr}"}
                },
                "maxParallelJobs": 2
            })),
            JobConfig::new("pick", "Pick", JobType::FanIn)
                .with_dependencies(["sweep"])
                .with_config(json!({
                    "fanOutJobId": "sweep",
                    "aggregation": {"strategy": "best-metric", "metricName": "accuracy"}
                })),
        ];

        let execution = orchestrator
            .execute_expanded("sweep", jobs, ExecuteOptions::new())
            .await
            .unwrap();

        assert_eq!(execution.jobs.len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let pick = execution.output("pick").unwrap();
        assert_eq!(pick["inputCount"], json!(3));
        assert_eq!(pick["aggregatedResult"]["lr"], json!(0.001));
        assert_eq!(pick["missingJobIds"], json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_fails_pipeline() {
        let orchestrator = echo()
            .handler_fn("stall", |_job, _ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("too late"))
            })
            .build()
            .unwrap();

        let jobs = vec![
            job("extract", "stall", &[]).with_timeout_ms(200),
            job("train", "echo", &["extract"]),
        ];
        let err = orchestrator
            .execute("stalls", jobs, ExecuteOptions::new())
            .await
            .unwrap_err();

        let OrchestratorError::JobFailed {
            job_id,
            error,
            execution,
        } = err
        else {
            panic!("expected job failure");
        };
        assert_eq!(job_id, JobId::new("extract"));
        assert_eq!(error, JobError::Timeout { timeout_ms: 200 });
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let extract = execution.job("extract").unwrap();
        assert_eq!(extract.status, JobStatus::Failed);
        assert_eq!(extract.attempts, 1);
        assert_eq!(execution.job("train").unwrap().status, JobStatus::Cancelled);
    }

    fn gated() -> (Arc<ApprovalManager>, Arc<Orchestrator>) {
        let manager = Arc::new(ApprovalManager::in_memory(ApprovalSettings {
            poll_interval_ms: 20,
            max_poll_attempts: 500,
            ..Default::default()
        }));
        let orchestrator = echo().approvals(manager.clone()).build().unwrap();
        (manager, Arc::new(orchestrator))
    }

    fn gated_jobs() -> Vec<JobConfig> {
        vec![
            job("train", "echo", &[]).with_config(json!({"model": "churn"})),
            job("gate", "approval", &["train"]).with_config(json!({
                "title": "Promote churn model",
                "notifyUsers": ["lead"]
            })),
            job("deploy", "echo", &["gate"]).with_config(json!({"target": "prod"})),
        ]
    }

    fn start(
        orchestrator: &Arc<Orchestrator>,
    ) -> tokio::task::JoinHandle<Result<Execution, OrchestratorError>> {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute("promote", gated_jobs(), ExecuteOptions::new())
                .await
        })
    }

    async fn pending_request(manager: &ApprovalManager) -> ApprovalRequest {
        loop {
            if let Some(request) = manager
                .list_pending(ApprovalFilter::default())
                .await
                .unwrap()
                .pop()
            {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_gate_releases_dependents() {
        let (manager, orchestrator) = gated();
        let running = start(&orchestrator);

        let request = pending_request(&manager).await;
        assert_eq!(request.workflow_id, "promote");
        assert_eq!(request.job_id, JobId::new("gate"));
        manager
            .approve(
                &request.id,
                ApproveInput {
                    user_id: "lead".to_string(),
                    comment: Some("metrics look good".to_string()),
                },
            )
            .await
            .unwrap();

        let execution = running.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let gate = execution.output("gate").unwrap();
        assert_eq!(gate["approved"], true);
        assert_eq!(gate["approvers"], json!(["lead"]));
        assert_eq!(execution.output("deploy"), Some(&json!({"target": "prod"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_gate_fails_pipeline() {
        let (manager, orchestrator) = gated();
        let running = start(&orchestrator);

        let request = pending_request(&manager).await;
        manager
            .reject(
                &request.id,
                RejectInput {
                    user_id: "lead".to_string(),
                    reason: "AUC regressed".to_string(),
                    comment: None,
                },
            )
            .await
            .unwrap();

        let err = running.await.unwrap().unwrap_err();
        let OrchestratorError::JobFailed {
            job_id,
            error,
            execution,
        } = err
        else {
            panic!("expected job failure");
        };
        assert_eq!(job_id, JobId::new("gate"));
        assert_eq!(
            error,
            JobError::ApprovalDenied {
                request_id: request.id,
                status: ApprovalStatus::Rejected,
                reason: Some("AUC regressed".to_string()),
            }
        );
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.job("gate").unwrap().attempts, 1);
        assert_eq!(execution.job("deploy").unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_polls_with_manager_settings() {
        let manager = Arc::new(ApprovalManager::in_memory(ApprovalSettings {
            poll_interval_ms: 20,
            max_poll_attempts: 3,
            ..Default::default()
        }));
        let orchestrator = Arc::new(echo().approvals(manager.clone()).build().unwrap());

        let err = start(&orchestrator).await.unwrap().unwrap_err();
        let OrchestratorError::JobFailed { job_id, error, .. } = err else {
            panic!("expected job failure");
        };
        assert_eq!(job_id, JobId::new("gate"));
        assert!(matches!(error, JobError::PollTimeout { attempts: 3, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_mid_poll_leaves_no_pending_requests() {
        for round in 0..50u64 {
            let (manager, orchestrator) = gated();
            let running = start(&orchestrator);

            let request = pending_request(&manager).await;
            // Land the cancel at varying points of the poll interval
            tokio::time::sleep(Duration::from_millis(round % 25)).await;
            let execution_id = orchestrator.list_executions().await[0].id;
            assert!(orchestrator.cancel(execution_id).await);

            let err = running.await.unwrap().unwrap_err();
            let OrchestratorError::Cancelled { execution } = err else {
                panic!("round {round}: expected cancellation");
            };
            assert_eq!(execution.job("gate").unwrap().status, JobStatus::Cancelled);
            assert_eq!(execution.job("deploy").unwrap().status, JobStatus::Cancelled);

            assert!(
                manager
                    .list_pending(ApprovalFilter::default())
                    .await
                    .unwrap()
                    .is_empty(),
                "round {round}: approval request left pending"
            );
            let closed = manager.get_request(&request.id).await.unwrap().unwrap();
            assert_eq!(closed.status, ApprovalStatus::Cancelled);
            assert_eq!(closed.decided_by.as_deref(), Some("system"));
        }
    }
}
