//! In-memory store double mirroring the semantics of [`SqliteBacklogStore`].
//! Used by scheduler and queue tests across the workspace.

use std::collections::HashSet;
use std::sync::Mutex;

use time::OffsetDateTime;

use crate::adapters::GroupService;
use crate::error::CoreError;
use crate::identifiers::{CheckpointId, ExecutionId, GroupId, IssueId, QueueEntryId};
use crate::model::{
    dependency_issue_ids, Checkpoint, Group, Issue, IssueRelationship, QueueEntry, SpecDoc, Stack,
};
use crate::status::{IssueStatus, QueueEntryStatus, ReviewStatus};
use crate::store::{
    stack_entries, validate_review_transition, BacklogStore, CheckpointStore, QueueStore,
};

#[derive(Default)]
struct BacklogState {
    issues: Vec<Issue>,
    specs: Vec<SpecDoc>,
    relationships: Vec<IssueRelationship>,
    groups: Vec<Group>,
    checkpoints: Vec<Checkpoint>,
    queue_entries: Vec<QueueEntry>,
}

#[derive(Default)]
pub struct InMemoryBacklog {
    state: Mutex<BacklogState>,
}

impl InMemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_issue(&self, issue: Issue) {
        self.state.lock().expect("lock").issues.push(issue);
    }

    pub fn add_spec(&self, spec: SpecDoc) {
        self.state.lock().expect("lock").specs.push(spec);
    }

    pub fn add_group(&self, group: Group) {
        self.state.lock().expect("lock").groups.push(group);
    }

    pub fn add_relationship(&self, relationship: IssueRelationship) {
        self.state
            .lock()
            .expect("lock")
            .relationships
            .push(relationship);
    }

    pub fn add_checkpoint(&self, checkpoint: Checkpoint) {
        self.state
            .lock()
            .expect("lock")
            .checkpoints
            .push(checkpoint);
    }

    pub fn add_queue_entry(&self, entry: QueueEntry) {
        self.state
            .lock()
            .expect("lock")
            .queue_entries
            .push(entry);
    }

    pub fn issue_status(&self, issue_id: &IssueId) -> Option<IssueStatus> {
        self.state
            .lock()
            .expect("lock")
            .issues
            .iter()
            .find(|issue| issue.id == *issue_id)
            .map(|issue| issue.status)
    }

    pub fn queue_entry(&self, entry_id: &QueueEntryId) -> Option<QueueEntry> {
        self.state
            .lock()
            .expect("lock")
            .queue_entries
            .iter()
            .find(|entry| entry.id == *entry_id)
            .cloned()
    }
}

impl BacklogStore for InMemoryBacklog {
    fn ready_issues(&self) -> Result<Vec<Issue>, CoreError> {
        let state = self.state.lock().expect("lock");
        let closed: HashSet<&IssueId> = state
            .issues
            .iter()
            .filter(|issue| issue.status == IssueStatus::Closed)
            .map(|issue| &issue.id)
            .collect();

        let mut ready: Vec<Issue> = state
            .issues
            .iter()
            .filter(|issue| issue.status == IssueStatus::Open)
            .filter(|issue| {
                dependency_issue_ids(&issue.id, &state.relationships)
                    .iter()
                    .all(|dependency| closed.contains(dependency))
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(ready)
    }

    fn issue(&self, issue_id: &IssueId) -> Result<Option<Issue>, CoreError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .issues
            .iter()
            .find(|issue| issue.id == *issue_id)
            .cloned())
    }

    fn list_issues(&self) -> Result<Vec<Issue>, CoreError> {
        Ok(self.state.lock().expect("lock").issues.clone())
    }

    fn list_specs(&self) -> Result<Vec<SpecDoc>, CoreError> {
        Ok(self.state.lock().expect("lock").specs.clone())
    }

    fn update_issue_status(
        &self,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("lock");
        let issue = state
            .issues
            .iter_mut()
            .find(|issue| issue.id == *issue_id)
            .ok_or_else(|| CoreError::Persistence(format!("issue {issue_id} not found")))?;
        issue.status = status;
        Ok(())
    }

    fn relationships_for(&self, issue_id: &IssueId) -> Result<Vec<IssueRelationship>, CoreError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .relationships
            .iter()
            .filter(|relationship| {
                relationship.source == *issue_id || relationship.target == *issue_id
            })
            .cloned()
            .collect())
    }
}

impl CheckpointStore for InMemoryBacklog {
    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        self.add_checkpoint(checkpoint.clone());
        Ok(())
    }

    fn checkpoints_for_issue(&self, issue_id: &IssueId) -> Result<Vec<Checkpoint>, CoreError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.issue_id == *issue_id)
            .cloned()
            .collect())
    }

    fn pending_checkpoints(&self, target_branch: &str) -> Result<Vec<Checkpoint>, CoreError> {
        let state = self.state.lock().expect("lock");
        let mut pending: Vec<Checkpoint> = state
            .checkpoints
            .iter()
            .filter(|checkpoint| {
                checkpoint.target_branch == target_branch
                    && checkpoint.review_status != ReviewStatus::Merged
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    fn latest_review_status(&self, issue_id: &IssueId) -> Result<Option<ReviewStatus>, CoreError> {
        let state = self.state.lock().expect("lock");
        Ok(state
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.issue_id == *issue_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|checkpoint| checkpoint.review_status))
    }

    fn merged_issue_ids(&self) -> Result<HashSet<IssueId>, CoreError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.review_status == ReviewStatus::Merged)
            .map(|checkpoint| checkpoint.issue_id.clone())
            .collect())
    }

    fn issue_for_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<IssueId>, CoreError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .checkpoints
            .iter()
            .find(|checkpoint| checkpoint.execution_id == *execution_id)
            .map(|checkpoint| checkpoint.issue_id.clone()))
    }

    fn update_review_status(
        &self,
        checkpoint_id: &CheckpointId,
        status: ReviewStatus,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("lock");
        let checkpoint = state
            .checkpoints
            .iter_mut()
            .find(|checkpoint| checkpoint.id == *checkpoint_id)
            .ok_or_else(|| {
                CoreError::Persistence(format!("checkpoint {checkpoint_id} not found"))
            })?;
        validate_review_transition(checkpoint.review_status, status)?;
        checkpoint.review_status = status;
        Ok(())
    }
}

impl QueueStore for InMemoryBacklog {
    fn insert_entry(&self, entry: &QueueEntry) -> Result<(), CoreError> {
        self.add_queue_entry(entry.clone());
        Ok(())
    }

    fn entries_for_branch(&self, target_branch: &str) -> Result<Vec<QueueEntry>, CoreError> {
        let state = self.state.lock().expect("lock");
        let mut entries: Vec<QueueEntry> = state
            .queue_entries
            .iter()
            .filter(|entry| entry.target_branch == target_branch)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.added_at.cmp(&b.added_at))
        });
        Ok(entries)
    }

    fn update_entry_status(
        &self,
        entry_id: &QueueEntryId,
        status: QueueEntryStatus,
        error: Option<String>,
        merge_commit: Option<String>,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("lock");
        let entry = state
            .queue_entries
            .iter_mut()
            .find(|entry| entry.id == *entry_id)
            .ok_or_else(|| {
                CoreError::Persistence(format!("queue entry {entry_id} not found"))
            })?;
        entry.status = status;
        entry.error = error;
        entry.merge_commit = merge_commit;
        Ok(())
    }
}

impl GroupService for InMemoryBacklog {
    fn group_for_issue(&self, issue_id: &IssueId) -> Result<Option<Group>, CoreError> {
        let state = self.state.lock().expect("lock");
        let group_id: Option<GroupId> = state
            .issues
            .iter()
            .find(|issue| issue.id == *issue_id)
            .and_then(|issue| issue.group_id.clone());
        Ok(group_id.and_then(|group_id| {
            state
                .groups
                .iter()
                .find(|group| group.id == group_id)
                .cloned()
        }))
    }

    fn list_stacks(&self) -> Result<Vec<Stack>, CoreError> {
        let state = self.state.lock().expect("lock");
        let mut stacks = Vec::with_capacity(state.groups.len());
        for group in &state.groups {
            let member_ids: Vec<IssueId> = state
                .issues
                .iter()
                .filter(|issue| issue.group_id.as_ref() == Some(&group.id))
                .map(|issue| issue.id.clone())
                .collect();
            stacks.push(Stack {
                stack: group.name.clone(),
                entries: stack_entries(&member_ids, &state.relationships),
            });
        }
        Ok(stacks)
    }
}

/// Issue fixture with sensible defaults for tests.
pub fn issue_fixture(id: &str, priority: u32, created_at: OffsetDateTime) -> Issue {
    Issue {
        id: IssueId::new(id),
        title: format!("Issue {id}"),
        content: String::new(),
        status: IssueStatus::Open,
        priority,
        group_id: None,
        created_at,
    }
}
