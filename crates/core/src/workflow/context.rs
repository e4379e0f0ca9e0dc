use crate::types::{
    Execution, ExecutionId, ExecutionStatus, JobConfig, JobExecutionState, JobId, JobStatus,
    LogLine,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Progress notification delivered to the submitter
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Log { job_id: JobId, line: LogLine },
    Progress { job_id: JobId, percent: u8 },
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
pub type JobCompleteCallback = Arc<dyn Fn(&JobExecutionState) + Send + Sync>;

/// Mutable state of one execution, shared between the engine and job contexts
pub(crate) struct ExecutionState {
    pub(crate) id: ExecutionId,
    pub(crate) name: String,
    pub(crate) started_at: DateTime<Utc>,
    status: RwLock<(ExecutionStatus, Option<DateTime<Utc>>)>,
    jobs: DashMap<JobId, JobExecutionState>,
    cancel_tx: watch::Sender<bool>,
}

impl ExecutionState {
    pub(crate) fn new(name: &str, jobs: &[JobConfig]) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: ExecutionId::new(),
            name: name.to_string(),
            started_at: Utc::now(),
            status: RwLock::new((ExecutionStatus::Running, None)),
            jobs: jobs
                .iter()
                .map(|job| (job.id.clone(), JobExecutionState::pending(job.id.clone())))
                .collect(),
            cancel_tx,
        }
    }

    pub(crate) fn update_job<F, R>(&self, job_id: &JobId, f: F) -> Option<R>
    where
        F: FnOnce(&mut JobExecutionState) -> R,
    {
        self.jobs.get_mut(job_id).map(|mut state| f(&mut state))
    }

    /// Mark every still-pending job cancelled, returning the affected ids
    pub(crate) fn cancel_pending(&self, note: &str) -> Vec<JobId> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if entry.status == JobStatus::Pending {
                entry.status = JobStatus::Cancelled;
                entry.completed_at = Some(now);
                entry.logs.push(LogLine {
                    timestamp: now,
                    message: note.to_string(),
                });
                cancelled.push(entry.key().clone());
            }
        }
        cancelled
    }

    pub(crate) fn job_state(&self, job_id: &JobId) -> Option<JobExecutionState> {
        self.jobs.get(job_id).map(|state| state.clone())
    }

    /// Output of a job, only once it has completed
    pub(crate) fn completed_output(&self, job_id: &JobId) -> Option<serde_json::Value> {
        self.jobs
            .get(job_id)
            .filter(|state| state.status == JobStatus::Completed)
            .and_then(|state| state.output.clone())
    }

    pub(crate) fn job_ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub(crate) async fn status(&self) -> ExecutionStatus {
        self.status.read().await.0
    }

    /// Move a running execution to a final status. Returns false if it already left `Running`.
    pub(crate) async fn finish(&self, status: ExecutionStatus) -> bool {
        let mut guard = self.status.write().await;
        if guard.0 != ExecutionStatus::Running {
            return false;
        }
        *guard = (status, Some(Utc::now()));
        true
    }

    pub(crate) fn signal_cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub(crate) fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) async fn snapshot(&self) -> Execution {
        let (status, completed_at) = *self.status.read().await;
        Execution {
            id: self.id,
            name: self.name.clone(),
            status,
            jobs: self
                .jobs
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            started_at: self.started_at,
            completed_at,
        }
    }
}

/// Per-job handle given to every handler invocation
#[derive(Clone)]
pub struct JobContext {
    execution: Arc<ExecutionState>,
    job_id: JobId,
    attempt: u32,
    on_progress: Option<ProgressCallback>,
    cancel_rx: watch::Receiver<bool>,
}

impl JobContext {
    pub(crate) fn new(
        execution: Arc<ExecutionState>,
        job_id: JobId,
        attempt: u32,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        let cancel_rx = execution.subscribe_cancel();
        Self {
            execution,
            job_id,
            attempt,
            on_progress,
            cancel_rx,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution.id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.execution.name
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// 1-based attempt number of the current invocation
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Append a timestamped line to this job's log
    pub fn log(&self, message: impl Into<String>) {
        let line = LogLine {
            timestamp: Utc::now(),
            message: message.into(),
        };
        tracing::debug!(
            execution_id = %self.execution.id,
            job_id = %self.job_id,
            "{}",
            line.message
        );

        self.execution
            .update_job(&self.job_id, |state| state.logs.push(line.clone()));

        if let Some(callback) = &self.on_progress {
            callback(&ProgressEvent::Log {
                job_id: self.job_id.clone(),
                line,
            });
        }
    }

    /// Output of another job in this execution, if it has completed
    pub fn job_output(&self, job_id: &str) -> Option<serde_json::Value> {
        self.execution.completed_output(&JobId::new(job_id))
    }

    /// Record progress in percent (clamped to 100)
    pub async fn update_progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.execution
            .update_job(&self.job_id, |state| state.progress = percent);

        if let Some(callback) = &self.on_progress {
            callback(&ProgressEvent::Progress {
                job_id: self.job_id.clone(),
                percent,
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the execution is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone: the execution can no longer be cancelled
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
impl JobContext {
    /// Context over a throwaway execution whose listed jobs are already completed
    pub(crate) fn with_outputs(job_id: &str, outputs: Vec<(&str, serde_json::Value)>) -> Self {
        let mut jobs: Vec<JobConfig> = outputs
            .iter()
            .map(|(id, _)| JobConfig::new(*id, *id, "task"))
            .collect();
        jobs.push(JobConfig::new(job_id, job_id, "task"));

        let execution = Arc::new(ExecutionState::new("test", &jobs));
        for (id, output) in outputs {
            execution.update_job(&JobId::new(id), |state| {
                state.status = JobStatus::Completed;
                state.output = Some(output);
            });
        }
        Self::new(execution, JobId::new(job_id), 1, None)
    }

    pub(crate) fn cancel_execution(&self) {
        self.execution.signal_cancel();
    }

    pub(crate) fn logs(&self) -> Vec<String> {
        self.execution
            .job_state(&self.job_id)
            .map(|state| state.logs.into_iter().map(|l| l.message).collect())
            .unwrap_or_default()
    }
}
