//! Domain model, adapter traits, and the sqlite-backed backlog store for the
//! foreman execution pipeline.

pub mod adapters;
pub mod error;
pub mod identifiers;
pub mod model;
pub mod status;
pub mod store;
pub mod test_support;


pub use adapters::{
    ExecutionRequest, ExecutionRuntime, GroupService, QualityGateCheck, QualityGateConfig,
    QualityGateReport, QualityGateRunner, SchedulerConfig, SchedulerConfigSource,
};
pub use error::CoreError;
pub use identifiers::{
    CheckpointId, ExecutionId, GroupId, IssueId, QueueEntryId, StreamId,
};
pub use model::{
    dependency_issue_ids, Checkpoint, Execution, Group, Issue, IssueRelationship, QueueEntry,
    RelationKind, SnapshotChange, SpecDoc, Stack, StackEntry,
};
pub use status::{
    ChangeType, ExecutionStatus, GroupStatus, IssueStatus, QueueEntryStatus, ReviewStatus,
};
pub use store::{
    validate_review_transition, BacklogStore, CheckpointStore, QueueStore, SqliteBacklogStore,
};
