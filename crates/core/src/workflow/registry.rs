use super::context::JobContext;
use crate::error::JobError;
use crate::types::{ExecutionId, JobConfig, JobType};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Executable logic behind a job type
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job and return its output
    async fn execute(&self, job: &JobConfig, ctx: &JobContext) -> Result<serde_json::Value, JobError>;

    /// Static pre-flight check of a job's configuration
    fn validate(&self, _job: &JobConfig) -> Result<(), String> {
        Ok(())
    }

    /// Whether successful results may be served from the result cache
    fn cacheable(&self) -> bool {
        true
    }

    /// Invoked when the execution is cancelled while this job is running
    async fn on_cancel(&self, _job: &JobConfig, _execution_id: ExecutionId, _reason: &str) {}
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobConfig, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn execute(&self, job: &JobConfig, ctx: &JobContext) -> Result<serde_json::Value, JobError> {
        (self.0)(job.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a job handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobConfig, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Maps job type tags to handlers. Built once, then read without locking.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!("Replaced handler for job type {}", job_type);
        }
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered type tags, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().map(|t| t.to_string()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::custom("echo"),
            handler_fn(|job, _ctx| async move { Ok(job.config) }),
        );

        assert!(registry.contains(&JobType::custom("echo")));
        assert!(!registry.contains(&JobType::custom("train")));

        let handler = registry.get(&JobType::custom("echo")).unwrap();
        let job = JobConfig::new("a", "A", "echo").with_config(json!({"x": 1}));
        let ctx = JobContext::with_outputs("a", vec![]);
        assert_eq!(handler.execute(&job, &ctx).await.unwrap(), json!({"x": 1}));
        assert!(handler.cacheable());
        assert!(handler.validate(&job).is_ok());
    }

    #[test]
    fn test_job_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::custom("train"), handler_fn(|_, _| async { Ok(json!(null)) }));
        registry.register(JobType::FanOut, handler_fn(|_, _| async { Ok(json!(null)) }));
        assert_eq!(registry.job_types(), vec!["fan-out", "train"]);
    }
}
