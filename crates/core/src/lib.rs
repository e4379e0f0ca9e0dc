// Core library for the kiln pipeline orchestrator

pub mod approval;
pub mod canonical;
pub mod config;
pub mod error;
pub mod parallel;
pub mod types;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use error::{ApprovalError, JobError, OrchestratorError, ValidationIssue};
pub use types::*;
pub use workflow::{ExecuteOptions, JobContext, JobHandler, Orchestrator, OrchestratorBuilder};
