use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identifiers::{CheckpointId, ExecutionId, GroupId, IssueId, QueueEntryId, StreamId};
use crate::status::{
    ChangeType, ExecutionStatus, GroupStatus, IssueStatus, QueueEntryStatus, ReviewStatus,
};

/// A backlog work item. Priority 0 is the highest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub content: String,
    pub status: IssueStatus,
    pub priority: u32,
    pub group_id: Option<GroupId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One run attempt against an issue. Owned by the scheduler for its active
/// lifetime; status and exit fields are written by the execution runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub issue_id: IssueId,
    pub status: ExecutionStatus,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub files_changed: Vec<String>,
}

/// Immutable snapshot of one execution's output. Checkpoints form a DAG via
/// their stream and parent-commit pointers; only `review_status` ever changes
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub issue_id: IssueId,
    pub execution_id: ExecutionId,
    pub stream_id: StreamId,
    pub commit_sha: String,
    pub parent_commit: Option<String>,
    pub changed_files: Vec<String>,
    pub review_status: ReviewStatus,
    pub target_branch: String,
    pub queue_position: Option<u32>,
    pub issue_snapshot: Option<String>,
    pub spec_snapshot: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One pending merge request in a per-branch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub execution_id: ExecutionId,
    pub stream_id: StreamId,
    pub target_branch: String,
    pub position: u32,
    pub priority: u32,
    pub status: QueueEntryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    pub error: Option<String>,
    pub merge_commit: Option<String>,
}

/// A cluster of issues sharing one working branch. At most one execution per
/// group runs at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub working_branch: String,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    pub issue_id: IssueId,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub stack: String,
    pub entries: Vec<StackEntry>,
}

/// A specification document tracked alongside issues in the backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDoc {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Blocks,
    DependsOn,
}

/// Directed relationship between two issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRelationship {
    pub source: IssueId,
    pub kind: RelationKind,
    pub target: IssueId,
}

/// One entry of a checkpoint's issue or spec snapshot. Snapshots are stored
/// as JSON arrays of these tuples with camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChange {
    pub id: String,
    pub change_type: ChangeType,
    pub entity: serde_json::Value,
}

/// Dependency issue ids for `issue_id`, derived from both relationship
/// directions: `X blocks issue_id` and `issue_id depends-on X` each make X a
/// dependency of `issue_id`.
pub fn dependency_issue_ids(
    issue_id: &IssueId,
    relationships: &[IssueRelationship],
) -> Vec<IssueId> {
    let mut dependencies = Vec::new();
    for relationship in relationships {
        let dependency = match relationship.kind {
            RelationKind::Blocks if relationship.target == *issue_id => &relationship.source,
            RelationKind::DependsOn if relationship.source == *issue_id => &relationship.target,
            _ => continue,
        };
        if !dependencies.contains(dependency) {
            dependencies.push(dependency.clone());
        }
    }
    dependencies
}
