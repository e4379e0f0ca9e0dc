use crate::types::{ApprovalId, ApprovalStatus, Execution, JobId};
use serde::{Deserialize, Serialize};

/// Classified failure of a single job, recorded on its execution state
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("invalid job configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{message}")]
    Handler { message: String },

    #[error("job timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error(
        "approval request {request_id} was {status}: {}",
        .reason.as_deref().unwrap_or("no reason given")
    )]
    ApprovalDenied {
        request_id: ApprovalId,
        status: ApprovalStatus,
        reason: Option<String>,
    },

    #[error("approval request {request_id} still pending after {attempts} polls")]
    PollTimeout { request_id: ApprovalId, attempts: u32 },

    #[error("no handler registered for job type '{job_type}'")]
    NoHandler { job_type: String },

    #[error("job was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        JobError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Handler failures and timeouts are transient; everything else is final
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Handler { .. } | JobError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout { .. })
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::handler(format!("{err:#}"))
    }
}

/// A problem found while validating a job graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("job '{job_id}' depends on unknown job '{dependency}'")]
    MissingDependency { job_id: JobId, dependency: JobId },

    #[error("job id '{job_id}' is defined more than once")]
    DuplicateJobId { job_id: JobId },

    #[error("circular dependency between jobs: {}", format_ids(.job_ids))]
    Cycle { job_ids: Vec<JobId> },

    #[error("fan-in job '{job_id}' references unknown fan-out job '{fan_out_job_id}'")]
    MissingFanOutSource { job_id: JobId, fan_out_job_id: JobId },

    #[error("no handler registered for job type '{job_type}' (job '{job_id}')")]
    UnknownJobType { job_id: JobId, job_type: String },

    #[error("job '{job_id}' has invalid configuration: {message}")]
    InvalidConfig { job_id: JobId, message: String },
}

fn format_ids(ids: &[JobId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Execution-level failure returned by the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("pipeline validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("job '{job_id}' failed: {error}")]
    JobFailed {
        job_id: JobId,
        error: JobError,
        execution: Box<Execution>,
    },

    #[error("execution {} was cancelled", .execution.id)]
    Cancelled { execution: Box<Execution> },

    #[error("job type '{0}' is reserved for a built-in handler")]
    ReservedHandlerType(String),
}

impl OrchestratorError {
    /// Snapshot of the execution, if it got far enough to start
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            OrchestratorError::JobFailed { execution, .. }
            | OrchestratorError::Cancelled { execution } => Some(execution),
            _ => None,
        }
    }
}

/// Errors from approval request lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(ApprovalId),

    #[error("approval request {id} is already {status}")]
    NotPending { id: ApprovalId, status: ApprovalStatus },

    #[error("user '{user_id}' is not allowed to approve request {id}")]
    NotAllowed { id: ApprovalId, user_id: String },

    #[error("user '{user_id}' has already approved request {id}")]
    AlreadyApproved { id: ApprovalId, user_id: String },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("a reason is required to reject an approval request")]
    ReasonRequired,

    #[error("requireMinApprovers of {required} cannot be met by {allowed} allowed approver(s)")]
    InvalidQuorum { required: u32, allowed: usize },

    #[error("timeoutMs of {0} is too large to compute an expiry")]
    InvalidTimeout(u64),

    #[error("approval storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(JobError::handler("boom").is_retryable());
        assert!(JobError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!JobError::invalid_config("bad").is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::ApprovalDenied {
            request_id: ApprovalId::new("r1"),
            status: ApprovalStatus::Rejected,
            reason: Some("no".to_string()),
        }
        .is_retryable());
    }

    #[test]
    fn test_job_error_serializes_with_kind_tag() {
        let value = serde_json::to_value(JobError::Timeout { timeout_ms: 200 }).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["timeout_ms"], 200);
    }

    #[test]
    fn test_cycle_message_lists_members() {
        let issue = ValidationIssue::Cycle {
            job_ids: vec![JobId::new("a"), JobId::new("b")],
        };
        assert_eq!(issue.to_string(), "circular dependency between jobs: a -> b");
    }
}
