//! Shared domain types for SpaghettiHub.
//!
//! Nothing in this crate performs I/O. The types here are the vocabulary
//! shared by the webhook ingress, the commit tracker, the sagas and the
//! store in the `spaghettihub` crate.

pub mod ids;
pub mod records;
pub mod sizing;
pub mod webhook;

pub use ids::{InvalidSagaId, RunnerSagaId};
pub use records::{CiPackage, CommitRecord, PortingWorkRecord, WorkStatus};
pub use sizing::{ByteSize, VmSize, size_for_labels};
pub use webhook::{
    CommitAuthor, PushCommit, PushEvent, WorkflowAction, WorkflowConclusion, WorkflowJob,
    WorkflowJobEvent,
};
