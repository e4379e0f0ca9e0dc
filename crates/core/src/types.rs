use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a job, unique within one pipeline graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Job type tag.
///
/// `fan-out`, `fan-in` and `approval` are reserved for the built-in handlers;
/// every other tag is caller-defined. Serialized as the plain tag string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    FanOut,
    FanIn,
    Approval,
    Custom(String),
}

impl JobType {
    pub const FAN_OUT: &'static str = "fan-out";
    pub const FAN_IN: &'static str = "fan-in";
    pub const APPROVAL: &'static str = "approval";

    pub fn custom(tag: impl Into<String>) -> Self {
        Self::from(tag.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::FanOut => Self::FAN_OUT,
            JobType::FanIn => Self::FAN_IN,
            JobType::Approval => Self::APPROVAL,
            JobType::Custom(tag) => tag,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, JobType::Custom(_))
    }
}

impl From<String> for JobType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            Self::FAN_OUT => JobType::FanOut,
            Self::FAN_IN => JobType::FanIn,
            Self::APPROVAL => JobType::Approval,
            _ => JobType::Custom(tag),
        }
    }
}

impl From<&str> for JobType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        match job_type {
            JobType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, retry_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            backoff_multiplier,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if millis.is_finite() && millis > 0.0 {
            Duration::from_millis(millis.round() as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// Shared concurrency cap for a group of jobs within one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    pub group: String,
    pub max: usize,
}

/// A single job in a pipeline graph. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<ConcurrencyLimit>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, job_type: impl Into<JobType>) -> Self {
        Self {
            id: JobId::new(id),
            name: name.into(),
            job_type: job_type.into(),
            depends_on: Vec::new(),
            config: empty_object(),
            retry_config: None,
            timeout_ms: None,
            concurrency_limit: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(|d| JobId::new(d)).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_config = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Status of a job within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Timestamped line in a job's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Runtime state of one job, mutated only by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionState {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub logs: Vec<LogLine>,
    pub progress: u8,
    pub output: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub from_cache: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobExecutionState {
    pub fn pending(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            attempts: 0,
            logs: Vec::new(),
            progress: 0,
            output: None,
            error: None,
            from_cache: false,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Status of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of a pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub name: String,
    pub status: ExecutionStatus,
    pub jobs: HashMap<JobId, JobExecutionState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn job(&self, job_id: &str) -> Option<&JobExecutionState> {
        self.jobs.get(&JobId::new(job_id))
    }

    pub fn output(&self, job_id: &str) -> Option<&serde_json::Value> {
        self.job(job_id).and_then(|state| state.output.as_ref())
    }
}

/// Unique identifier for an approval request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(pub String);

impl ApprovalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Approval request lifecycle status. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Cancelled => "cancelled",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded approval from one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproverEntry {
    pub user_id: String,
    pub comment: Option<String>,
    pub approved_at: DateTime<Utc>,
}

/// Human approval request gating a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub workflow_id: String,
    pub job_id: JobId,
    pub execution_id: String,
    pub title: String,
    pub description: String,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub notify_users: Vec<String>,
    pub notify_channels: Vec<String>,
    pub allowed_approvers: Vec<String>,
    pub approvers: Vec<ApproverEntry>,
    pub require_min_approvers: u32,
    pub current_approver_count: u32,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ApprovalRequest {
    pub fn has_approved(&self, user_id: &str) -> bool {
        self.approvers.iter().any(|a| a.user_id == user_id)
    }

    /// Whether `user_id` passes the allow-list (an empty list allows anyone)
    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.allowed_approvers.is_empty() || self.allowed_approvers.iter().any(|u| u == user_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}
