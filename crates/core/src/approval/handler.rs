use super::conditions::{all_match, AutoApproveCondition};
use super::manager::{ApprovalManager, CreateApprovalRequest};
use crate::config::ApprovalSettings;
use crate::error::{ApprovalError, JobError};
use crate::types::{ApprovalId, ApprovalStatus, ExecutionId, JobConfig, JobId};
use crate::workflow::{JobContext, JobHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// `config` of an `approval` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalJobConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub notify_users: Vec<String>,
    #[serde(default)]
    pub notify_channels: Vec<String>,
    #[serde(default)]
    pub allowed_approvers: Vec<String>,
    #[serde(default)]
    pub require_min_approvers: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auto_approve_conditions: Vec<AutoApproveCondition>,
    /// Overrides the orchestrator-wide poll interval
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_poll_attempts: Option<u32>,
}

impl ApprovalJobConfig {
    pub fn from_job(job: &JobConfig) -> Result<Self, JobError> {
        let config: Self = serde_json::from_value(job.config.clone())
            .map_err(|e| JobError::invalid_config(format!("invalid approval config: {e}")))?;

        if config.title.trim().is_empty() {
            return Err(JobError::invalid_config("approval job requires a title"));
        }
        if config.notify_users.is_empty() {
            return Err(JobError::invalid_config(
                "approval job requires at least one entry in notifyUsers",
            ));
        }
        if let Some(required) = config.require_min_approvers {
            let allowed = config.allowed_approvers.len();
            if required == 0 || (allowed > 0 && required as usize > allowed) {
                return Err(JobError::invalid_config(
                    ApprovalError::InvalidQuorum { required, allowed }.to_string(),
                ));
            }
        }
        Ok(config)
    }
}

fn approval_failure(error: ApprovalError) -> JobError {
    match error {
        ApprovalError::MissingField(_)
        | ApprovalError::InvalidQuorum { .. }
        | ApprovalError::InvalidTimeout(_) => {
            JobError::invalid_config(error.to_string())
        }
        other => JobError::handler(other.to_string()),
    }
}

/// Built-in handler for `approval` jobs: raises a request and blocks until it is decided
pub struct ApprovalHandler {
    manager: Arc<ApprovalManager>,
    settings: ApprovalSettings,
}

impl ApprovalHandler {
    pub fn new(manager: Arc<ApprovalManager>, settings: ApprovalSettings) -> Self {
        Self { manager, settings }
    }

    pub fn manager(&self) -> &Arc<ApprovalManager> {
        &self.manager
    }

    /// Cancel the pending request raised for `job_id` in `execution_id`, if any
    pub async fn cancel(
        &self,
        job_id: &JobId,
        execution_id: &str,
        reason: &str,
    ) -> Result<bool, ApprovalError> {
        let Some(request) = self.manager.find_for_job(execution_id, job_id).await? else {
            return Ok(false);
        };
        if request.status != ApprovalStatus::Pending {
            return Ok(false);
        }
        self.cancel_request(&request.id, reason).await
    }

    async fn cancel_request(&self, id: &ApprovalId, reason: &str) -> Result<bool, ApprovalError> {
        match self
            .manager
            .cancel(id, &self.settings.system_actor, reason)
            .await
        {
            Ok(_) => Ok(true),
            // Decided concurrently
            Err(ApprovalError::NotPending { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for ApprovalHandler {
    async fn execute(&self, job: &JobConfig, ctx: &JobContext) -> Result<Value, JobError> {
        let config = ApprovalJobConfig::from_job(job)?;

        if all_match(&config.auto_approve_conditions, &job.config) {
            tracing::info!("Job {} auto-approved", job.id);
            ctx.log("All auto-approve conditions matched");
            return Ok(json!({
                "approved": true,
                "autoApproved": true,
            }));
        }

        let request = self
            .manager
            .create_request(CreateApprovalRequest {
                workflow_id: ctx.pipeline_name().to_string(),
                job_id: job.id.clone(),
                execution_id: ctx.execution_id().to_string(),
                title: config.title.clone(),
                description: config.description.clone(),
                requested_by: self.settings.system_actor.clone(),
                notify_users: config.notify_users.clone(),
                notify_channels: config.notify_channels.clone(),
                allowed_approvers: config.allowed_approvers.clone(),
                require_min_approvers: config.require_min_approvers,
                timeout_ms: config.timeout_ms,
                metadata: json!({ "jobName": job.name }),
            })
            .await
            .map_err(approval_failure)?;

        ctx.log(format!("Waiting for approval request {}", request.id));

        let poll_interval = config
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.settings.poll_interval());
        let max_attempts = config
            .max_poll_attempts
            .unwrap_or(self.settings.max_poll_attempts);

        for _ in 0..max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = ctx.cancelled() => {
                    // Whichever of this loop and `on_cancel` gets there first closes the request
                    if let Err(e) = self.cancel_request(&request.id, "Execution cancelled").await {
                        tracing::warn!("Failed to cancel approval {}: {}", request.id, e);
                    }
                    ctx.log(format!("Execution cancelled, approval request {} withdrawn", request.id));
                    return Err(JobError::Cancelled);
                }
            }

            let Some(current) = self
                .manager
                .get_request(&request.id)
                .await
                .map_err(approval_failure)?
            else {
                return Err(JobError::handler(format!(
                    "approval request {} disappeared",
                    request.id
                )));
            };

            match current.status {
                ApprovalStatus::Pending => continue,
                ApprovalStatus::Approved => {
                    ctx.log(format!("Approval request {} approved", current.id));
                    let approvers: Vec<&str> =
                        current.approvers.iter().map(|a| a.user_id.as_str()).collect();
                    return Ok(json!({
                        "approved": true,
                        "requestId": current.id,
                        "approvers": approvers,
                        "decidedBy": current.decided_by,
                        "decidedAt": current.decided_at,
                    }));
                }
                status => {
                    ctx.log(format!("Approval request {} {}", current.id, status));
                    return Err(JobError::ApprovalDenied {
                        request_id: current.id,
                        status,
                        reason: current.reason,
                    });
                }
            }
        }

        Err(JobError::PollTimeout {
            request_id: request.id,
            attempts: max_attempts,
        })
    }

    fn validate(&self, job: &JobConfig) -> Result<(), String> {
        ApprovalJobConfig::from_job(job)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn on_cancel(&self, job: &JobConfig, execution_id: ExecutionId, reason: &str) {
        if let Err(e) = self.cancel(&job.id, &execution_id.to_string(), reason).await {
            tracing::warn!("Failed to cancel approval for job {}: {}", job.id, e);
        }
    }
}
