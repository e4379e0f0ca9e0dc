pub mod cache;
pub mod context;
pub mod dag;
pub mod executor;
pub mod expansion;
pub mod registry;
pub(crate) mod step_executor;

pub use cache::{fingerprint, InMemoryResultCache, ResultCache};
pub use context::{JobCompleteCallback, JobContext, ProgressCallback, ProgressEvent};
pub use dag::{execution_levels, topological_sort, validate, JobDag, ValidationReport};
pub use executor::{ExecuteOptions, Orchestrator, OrchestratorBuilder};
pub use expansion::expand_fan_outs;
pub use registry::{handler_fn, HandlerRegistry, JobHandler};
