use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use foreman_core::{
    dependency_issue_ids, BacklogStore, CheckpointStore, CoreError, ExecutionId, GroupService,
    IssueId, QueueEntry, QueueEntryStatus, QueueStore, ReviewStatus,
};

/// Bucket key for queue entries whose issue belongs to no stack.
pub const STANDALONE_STACK: &str = "standalone";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFilters {
    pub include_statuses: Option<Vec<QueueEntryStatus>>,
    pub exclude_statuses: Vec<QueueEntryStatus>,
}

impl QueueFilters {
    fn admits(&self, status: QueueEntryStatus) -> bool {
        if self.exclude_statuses.contains(&status) {
            return false;
        }
        match &self.include_statuses {
            Some(included) => included.contains(&status),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMembership {
    pub stack: String,
    pub depth: u32,
}

/// A raw queue entry joined with everything a review surface needs: issue
/// identity, dependency issue ids, latest checkpoint review status, stack
/// membership, and the computed promotion flag. `position` is 1-indexed and
/// recomputed on every query — persisted ordinals are never trusted across
/// calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedQueueEntry {
    pub entry: QueueEntry,
    pub issue_id: Option<IssueId>,
    pub issue_title: Option<String>,
    pub dependency_issue_ids: Vec<IssueId>,
    pub review_status: Option<ReviewStatus>,
    pub stack: Option<StackMembership>,
    pub can_promote: bool,
    pub position: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: HashMap<QueueEntryStatus, usize>,
    pub by_stack: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<EnrichedQueueEntry>,
    pub stats: QueueStats,
}

/// Outcome of a reorder request. A violation is an expected user-facing
/// condition, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderValidation {
    pub valid: bool,
    pub blocked_by: Vec<IssueId>,
}

pub struct QueueViewService {
    backlog: Arc<dyn BacklogStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    queue: Arc<dyn QueueStore>,
    groups: Arc<dyn GroupService>,
}

impl QueueViewService {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        queue: Arc<dyn QueueStore>,
        groups: Arc<dyn GroupService>,
    ) -> Self {
        Self {
            backlog,
            checkpoints,
            queue,
            groups,
        }
    }

    /// Enriched entries for one target branch, filtered by status, with
    /// positions assigned over the filtered result set.
    pub fn enriched_queue(
        &self,
        target_branch: &str,
        filters: &QueueFilters,
    ) -> Result<Vec<EnrichedQueueEntry>, CoreError> {
        let enriched = self.enrich_all(target_branch)?;
        Ok(apply_filters(enriched, filters))
    }

    /// Stats over the unfiltered queue, so callers can render "3 of 12
    /// shown" even while a filter is active.
    pub fn queue_stats(&self, target_branch: &str) -> Result<QueueStats, CoreError> {
        let enriched = self.enrich_all(target_branch)?;
        Ok(compute_stats(&enriched))
    }

    pub fn queue_with_stats(
        &self,
        target_branch: &str,
        filters: &QueueFilters,
    ) -> Result<QueueSnapshot, CoreError> {
        let enriched = self.enrich_all(target_branch)?;
        let stats = compute_stats(&enriched);
        Ok(QueueSnapshot {
            entries: apply_filters(enriched, filters),
            stats,
        })
    }

    /// Moving an entry earlier than one of its dependencies is rejected with
    /// the dependency's issue id; moving it to the same or a later position
    /// is always safe because dependencies may trail their dependents.
    pub fn validate_reorder(
        &self,
        execution_id: &ExecutionId,
        new_position: u32,
        target_branch: &str,
    ) -> Result<ReorderValidation, CoreError> {
        let enriched = self.enrich_all(target_branch)?;
        let subject = enriched
            .iter()
            .find(|entry| entry.entry.execution_id == *execution_id)
            .ok_or_else(|| {
                CoreError::Configuration(format!(
                    "no queue entry for execution {execution_id} on branch {target_branch}"
                ))
            })?;

        let new_position = new_position.max(1);
        if new_position >= subject.position {
            return Ok(ReorderValidation {
                valid: true,
                blocked_by: Vec::new(),
            });
        }

        let dependencies: HashSet<&IssueId> = subject.dependency_issue_ids.iter().collect();
        let mut blocked_by = Vec::new();
        for entry in &enriched {
            let Some(issue_id) = &entry.issue_id else {
                continue;
            };
            if entry.position >= new_position
                && dependencies.contains(issue_id)
                && !blocked_by.contains(issue_id)
            {
                blocked_by.push(issue_id.clone());
            }
        }

        Ok(ReorderValidation {
            valid: blocked_by.is_empty(),
            blocked_by,
        })
    }

    /// Enrichment over the unfiltered branch queue, positions assigned over
    /// the full set.
    fn enrich_all(&self, target_branch: &str) -> Result<Vec<EnrichedQueueEntry>, CoreError> {
        let entries = self.queue.entries_for_branch(target_branch)?;
        let merged = self.checkpoints.merged_issue_ids()?;
        let stacks = self.groups.list_stacks()?;

        let mut stack_by_issue: HashMap<IssueId, StackMembership> = HashMap::new();
        for stack in &stacks {
            for member in &stack.entries {
                stack_by_issue.insert(
                    member.issue_id.clone(),
                    StackMembership {
                        stack: stack.stack.clone(),
                        depth: member.depth,
                    },
                );
            }
        }

        let mut enriched = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let issue_id = self.checkpoints.issue_for_execution(&entry.execution_id)?;

            let (issue_title, dependency_issue_ids, review_status, stack) = match &issue_id {
                Some(issue_id) => {
                    let title = self
                        .backlog
                        .issue(issue_id)?
                        .map(|issue| issue.title);
                    let relationships = self.backlog.relationships_for(issue_id)?;
                    let dependencies = dependency_issue_ids(issue_id, &relationships);
                    let review_status = self.checkpoints.latest_review_status(issue_id)?;
                    let stack = stack_by_issue.get(issue_id).cloned();
                    (title, dependencies, review_status, stack)
                }
                // A broken entry stays visible with can_promote false; the
                // queue never hides what it cannot resolve.
                None => (None, Vec::new(), None, None),
            };

            let review_allows = matches!(
                review_status,
                Some(ReviewStatus::Approved) | Some(ReviewStatus::Merged)
            );
            let can_promote = issue_id.is_some()
                && review_allows
                && dependency_issue_ids
                    .iter()
                    .all(|dependency| merged.contains(dependency));

            enriched.push(EnrichedQueueEntry {
                entry,
                issue_id,
                issue_title,
                dependency_issue_ids,
                review_status,
                stack,
                can_promote,
                position: (index + 1) as u32,
            });
        }

        Ok(enriched)
    }
}

fn apply_filters(
    enriched: Vec<EnrichedQueueEntry>,
    filters: &QueueFilters,
) -> Vec<EnrichedQueueEntry> {
    let mut filtered: Vec<EnrichedQueueEntry> = enriched
        .into_iter()
        .filter(|entry| filters.admits(entry.entry.status))
        .collect();
    for (index, entry) in filtered.iter_mut().enumerate() {
        entry.position = (index + 1) as u32;
    }
    filtered
}

fn compute_stats(enriched: &[EnrichedQueueEntry]) -> QueueStats {
    let mut by_status: HashMap<QueueEntryStatus, usize> = HashMap::new();
    let mut by_stack: HashMap<String, usize> = HashMap::new();
    for entry in enriched {
        *by_status.entry(entry.entry.status).or_insert(0) += 1;
        let stack = entry
            .stack
            .as_ref()
            .map(|membership| membership.stack.clone())
            .unwrap_or_else(|| STANDALONE_STACK.to_owned());
        *by_stack.entry(stack).or_insert(0) += 1;
    }
    QueueStats {
        total: enriched.len(),
        by_status,
        by_stack,
    }
}
