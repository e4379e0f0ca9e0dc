use super::notify::{ApprovalNotifier, TracingNotifier};
use super::repository::{ApprovalFilter, ApprovalRepository, InMemoryApprovalRepository};
use crate::config::ApprovalSettings;
use crate::error::ApprovalError;
use crate::types::{ApprovalId, ApprovalRequest, ApprovalStatus, ApproverEntry, JobId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What the timeout checker does with an expired pending request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Reject,
    Approve,
    Expire,
}

/// Input to [`ApprovalManager::create_request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApprovalRequest {
    pub workflow_id: String,
    pub job_id: JobId,
    pub execution_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub requested_by: String,
    #[serde(default)]
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
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveInput {
    pub user_id: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectInput {
    pub user_id: String,
    pub reason: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub workflow_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub expired: usize,
    /// Mean of `decidedAt - createdAt` over decided requests
    pub average_decision_ms: Option<f64>,
}

/// Lifecycle authority for approval requests.
///
/// Every mutation runs under one async lock, so concurrent approvals of the
/// same request never lose an update.
pub struct ApprovalManager {
    repository: Arc<dyn ApprovalRepository>,
    notifier: Arc<dyn ApprovalNotifier>,
    settings: ApprovalSettings,
    write_lock: Mutex<()>,
    timeout_checker: Mutex<Option<JoinHandle<()>>>,
}

impl ApprovalManager {
    pub fn new(
        repository: Arc<dyn ApprovalRepository>,
        notifier: Arc<dyn ApprovalNotifier>,
        settings: ApprovalSettings,
    ) -> Self {
        Self {
            repository,
            notifier,
            settings,
            write_lock: Mutex::new(()),
            timeout_checker: Mutex::new(None),
        }
    }

    /// In-memory storage with log notifications
    pub fn in_memory(settings: ApprovalSettings) -> Self {
        Self::new(
            Arc::new(InMemoryApprovalRepository::new()),
            Arc::new(TracingNotifier),
            settings,
        )
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    /// Persist a new pending request and notify its recipients
    pub async fn create_request(
        &self,
        input: CreateApprovalRequest,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let required = [
            ("workflowId", input.workflow_id.as_str()),
            ("jobId", input.job_id.as_str()),
            ("executionId", input.execution_id.as_str()),
            ("title", input.title.as_str()),
            ("requestedBy", input.requested_by.as_str()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ApprovalError::MissingField(*field));
        }

        let require_min_approvers = input.require_min_approvers.unwrap_or(1);
        let allowed = input.allowed_approvers.len();
        if require_min_approvers == 0 || (allowed > 0 && require_min_approvers as usize > allowed) {
            return Err(ApprovalError::InvalidQuorum {
                required: require_min_approvers,
                allowed,
            });
        }

        let now = Utc::now();
        let expires_at = match input.timeout_ms {
            None => None,
            Some(ms) => Some(
                i64::try_from(ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .and_then(|timeout| now.checked_add_signed(timeout))
                    .ok_or(ApprovalError::InvalidTimeout(ms))?,
            ),
        };

        let request = ApprovalRequest {
            id: ApprovalId::generate(),
            workflow_id: input.workflow_id,
            job_id: input.job_id,
            execution_id: input.execution_id,
            title: input.title,
            description: input.description,
            status: ApprovalStatus::Pending,
            requested_by: input.requested_by,
            notify_users: input.notify_users,
            notify_channels: input.notify_channels,
            allowed_approvers: input.allowed_approvers,
            approvers: Vec::new(),
            require_min_approvers,
            current_approver_count: 0,
            decided_by: None,
            decided_at: None,
            reason: None,
            created_at: now,
            expires_at,
            metadata: input.metadata,
        };

        self.repository.insert(&request).await?;
        tracing::info!(
            "Created approval request {} for job {} (quorum {})",
            request.id,
            request.job_id,
            request.require_min_approvers
        );

        if let Err(e) = self.notifier.notify(&request).await {
            tracing::warn!("Failed to send notifications for approval {}: {:#}", request.id, e);
        }

        Ok(request)
    }

    /// Load a pending request under the write lock, apply `f`, and store the result
    async fn transition<F>(&self, id: &ApprovalId, f: F) -> Result<ApprovalRequest, ApprovalError>
    where
        F: FnOnce(&mut ApprovalRequest) -> Result<(), ApprovalError>,
    {
        let _guard = self.write_lock.lock().await;

        let mut request = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(id.clone()))?;

        if request.status.is_terminal() {
            return Err(ApprovalError::NotPending {
                id: id.clone(),
                status: request.status,
            });
        }

        f(&mut request)?;
        self.repository.update(&request).await?;
        Ok(request)
    }

    /// Record an approval; the request turns `approved` once the quorum is reached
    pub async fn approve(
        &self,
        id: &ApprovalId,
        input: ApproveInput,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = self
            .transition(id, |request| {
                if !request.is_allowed(&input.user_id) {
                    return Err(ApprovalError::NotAllowed {
                        id: request.id.clone(),
                        user_id: input.user_id.clone(),
                    });
                }
                if request.has_approved(&input.user_id) {
                    return Err(ApprovalError::AlreadyApproved {
                        id: request.id.clone(),
                        user_id: input.user_id.clone(),
                    });
                }

                let now = Utc::now();
                request.approvers.push(ApproverEntry {
                    user_id: input.user_id.clone(),
                    comment: input.comment.clone(),
                    approved_at: now,
                });
                request.current_approver_count += 1;

                if request.current_approver_count >= request.require_min_approvers {
                    request.status = ApprovalStatus::Approved;
                    request.decided_by = Some(input.user_id.clone());
                    request.decided_at = Some(now);
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            "Approval {} approved by {} ({}/{}), status {}",
            request.id,
            input.user_id,
            request.current_approver_count,
            request.require_min_approvers,
            request.status
        );
        Ok(request)
    }

    /// Reject a request. A single rejection is final.
    pub async fn reject(
        &self,
        id: &ApprovalId,
        input: RejectInput,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if input.reason.trim().is_empty() {
            return Err(ApprovalError::ReasonRequired);
        }

        let request = self
            .transition(id, |request| {
                request.status = ApprovalStatus::Rejected;
                request.decided_by = Some(input.user_id.clone());
                request.decided_at = Some(Utc::now());
                request.reason = Some(match &input.comment {
                    Some(comment) => format!("{} ({})", input.reason, comment),
                    None => input.reason.clone(),
                });
                Ok(())
            })
            .await?;

        tracing::info!("Approval {} rejected by {}", request.id, input.user_id);
        Ok(request)
    }

    /// Force a pending request to `cancelled` regardless of approvals so far
    pub async fn cancel(
        &self,
        id: &ApprovalId,
        user_id: &str,
        reason: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = self
            .transition(id, |request| {
                request.status = ApprovalStatus::Cancelled;
                request.decided_by = Some(user_id.to_string());
                request.decided_at = Some(Utc::now());
                request.reason = Some(reason.to_string());
                Ok(())
            })
            .await?;

        tracing::info!("Approval {} cancelled by {}: {}", request.id, user_id, reason);
        Ok(request)
    }

    /// Whether `user_id` could approve right now. Unknown requests yield `false`.
    pub async fn can_approve(&self, id: &ApprovalId, user_id: &str) -> Result<bool, ApprovalError> {
        Ok(self.repository.get(id).await?.is_some_and(|request| {
            request.status == ApprovalStatus::Pending
                && request.is_allowed(user_id)
                && !request.has_approved(user_id)
        }))
    }

    pub async fn get_request(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, ApprovalError> {
        Ok(self.repository.get(id).await?)
    }

    /// Pending requests matching `filter` (its status field is ignored)
    pub async fn list_pending(
        &self,
        filter: ApprovalFilter,
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let filter = ApprovalFilter {
            status: Some(ApprovalStatus::Pending),
            ..filter
        };
        Ok(self.repository.list(&filter).await?)
    }

    /// Most recent request raised for a job within an execution
    pub async fn find_for_job(
        &self,
        execution_id: &str,
        job_id: &JobId,
    ) -> Result<Option<ApprovalRequest>, ApprovalError> {
        let filter = ApprovalFilter {
            execution_id: Some(execution_id.to_string()),
            job_id: Some(job_id.clone()),
            ..Default::default()
        };
        Ok(self.repository.list(&filter).await?.pop())
    }

    /// Apply the timeout action to every expired pending request, returning those changed
    pub async fn check_timeouts(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let now = Utc::now();
        let expired: Vec<ApprovalId> = self
            .repository
            .list(&ApprovalFilter::pending())
            .await?
            .into_iter()
            .filter(|request| request.is_expired_at(now))
            .map(|request| request.id)
            .collect();

        let action = self.settings.timeout_action;
        let actor = self.settings.system_actor.clone();
        let mut changed = Vec::with_capacity(expired.len());

        for id in expired {
            let result = self
                .transition(&id, |request| {
                    request.status = match action {
                        TimeoutAction::Reject => ApprovalStatus::Rejected,
                        TimeoutAction::Approve => ApprovalStatus::Approved,
                        TimeoutAction::Expire => ApprovalStatus::Expired,
                    };
                    request.decided_by = Some(actor.clone());
                    request.decided_at = Some(now);
                    request.reason = Some("Approval request timed out".to_string());
                    Ok(())
                })
                .await;

            match result {
                Ok(request) => {
                    tracing::info!("Approval {} timed out, now {}", request.id, request.status);
                    changed.push(request);
                }
                // Decided between the scan and the transition
                Err(ApprovalError::NotPending { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(changed)
    }

    /// Start the periodic timeout scan. Calling it again while running is a no-op.
    pub async fn start_timeout_checker(self: &Arc<Self>) {
        let mut checker = self.timeout_checker.lock().await;
        if checker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.settings.timeout_check_interval();
        let manager: Weak<Self> = Arc::downgrade(self);

        *checker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.check_timeouts().await {
                    tracing::error!("Approval timeout check failed: {}", e);
                }
            }
        }));

        tracing::info!("Started approval timeout checker every {:?}", period);
    }

    /// Stop the periodic scan. Safe to call when it is not running.
    pub async fn stop_timeout_checker(&self) {
        if let Some(handle) = self.timeout_checker.lock().await.take() {
            handle.abort();
            tracing::info!("Stopped approval timeout checker");
        }
    }

    pub async fn is_timeout_checker_running(&self) -> bool {
        self.timeout_checker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Counts by status and mean decision latency
    pub async fn get_stats(&self, filter: StatsFilter) -> Result<ApprovalStats, ApprovalError> {
        let requests = self
            .repository
            .list(&ApprovalFilter {
                workflow_id: filter.workflow_id,
                created_after: filter.since,
                created_before: filter.until,
                ..Default::default()
            })
            .await?;

        let mut stats = ApprovalStats {
            total: requests.len(),
            ..Default::default()
        };
        let mut latency_sum_ms = 0.0;
        let mut decided = 0usize;

        for request in &requests {
            match request.status {
                ApprovalStatus::Pending => stats.pending += 1,
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Rejected => stats.rejected += 1,
                ApprovalStatus::Cancelled => stats.cancelled += 1,
                ApprovalStatus::Expired => stats.expired += 1,
            }
            if let Some(decided_at) = request.decided_at {
                latency_sum_ms += (decided_at - request.created_at).num_milliseconds() as f64;
                decided += 1;
            }
        }

        stats.average_decision_ms = (decided > 0).then(|| latency_sum_ms / decided as f64);
        Ok(stats)
    }
}

impl Drop for ApprovalManager {
    fn drop(&mut self) {
        if let Ok(mut checker) = self.timeout_checker.try_lock() {
            if let Some(handle) = checker.take() {
                handle.abort();
            }
        }
    }
}
