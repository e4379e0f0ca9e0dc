use crate::types::ApprovalRequest;
use anyhow::Result;

/// Delivers "your approval is needed" notices. Failures are logged by the caller, never fatal.
#[async_trait::async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, request: &ApprovalRequest) -> Result<()>;
}

/// Writes notices to the log
pub struct TracingNotifier;

#[async_trait::async_trait]
impl ApprovalNotifier for TracingNotifier {
    async fn notify(&self, request: &ApprovalRequest) -> Result<()> {
        tracing::info!(
            request_id = %request.id,
            users = ?request.notify_users,
            channels = ?request.notify_channels,
            "Approval requested: {}",
            request.title
        );
        Ok(())
    }
}
