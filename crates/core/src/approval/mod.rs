//! Human-in-the-loop approval gates
//!
//! [`ApprovalManager`] owns the request lifecycle (quorum, rejection,
//! cancellation and timeouts) on top of an [`ApprovalRepository`].
//! [`ApprovalHandler`] is the built-in `approval` job type that raises a
//! request and blocks the job until it is decided.

mod conditions;
mod handler;
mod manager;
mod notify;
mod repository;

pub use conditions::{all_match, lookup_path, AutoApproveCondition, ConditionOperator};
pub use handler::{ApprovalHandler, ApprovalJobConfig};
pub use manager::{
    ApprovalManager, ApprovalStats, ApproveInput, CreateApprovalRequest, RejectInput, StatsFilter,
    TimeoutAction,
};
pub use notify::{ApprovalNotifier, TracingNotifier};
pub use repository::{
    ApprovalFilter, ApprovalRepository, InMemoryApprovalRepository, RedbApprovalRepository,
};
