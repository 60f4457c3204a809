use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use foreman_core::{
    CheckpointStore, CoreError, QueueEntryId, QueueEntryStatus, QueueStore, ReviewStatus,
};
use foreman_vcs::{CommandRunner, GitSyncEngine, MergeOptions, MergeStrategy, VcsError};

use crate::view::{QueueFilters, QueueViewService};

const SAFETY_TAG_PREFIX: &str = "foreman/pre-merge-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionOutcome {
    Promoted {
        entry_id: QueueEntryId,
        merge_commit: String,
    },
    Conflicted {
        entry_id: QueueEntryId,
        conflicting_files: Vec<String>,
    },
    AlreadyMerging,
    DirtyWorkingTree,
    NothingEligible,
}

/// Drains the merge queue one entry at a time. Mutating VCS operations are
/// not safe to run concurrently against one working copy, so promotion is
/// serialized per target branch: an entry already `merging` parks the whole
/// branch until it resolves.
pub struct QueueProcessor<R: CommandRunner> {
    view: QueueViewService,
    queue: Arc<dyn QueueStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    engine: GitSyncEngine<R>,
    repo_root: PathBuf,
}

impl<R: CommandRunner> QueueProcessor<R> {
    pub fn new(
        view: QueueViewService,
        queue: Arc<dyn QueueStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        engine: GitSyncEngine<R>,
        repo_root: PathBuf,
    ) -> Self {
        Self {
            view,
            queue,
            checkpoints,
            engine,
            repo_root,
        }
    }

    /// Promotes the head promotable entry for `target_branch`. Assumes the
    /// repository has the target branch checked out.
    pub fn promote_next(&self, target_branch: &str) -> Result<PromotionOutcome, CoreError> {
        let enriched = self.view.enriched_queue(target_branch, &QueueFilters::default())?;
        if enriched
            .iter()
            .any(|entry| entry.entry.status == QueueEntryStatus::Merging)
        {
            return Ok(PromotionOutcome::AlreadyMerging);
        }

        let Some(candidate) = enriched.iter().find(|entry| {
            entry.can_promote
                && matches!(
                    entry.entry.status,
                    QueueEntryStatus::Pending | QueueEntryStatus::Ready
                )
        }) else {
            return Ok(PromotionOutcome::NothingEligible);
        };

        let issue_id = candidate
            .issue_id
            .as_ref()
            .ok_or_else(|| {
                CoreError::Runtime(format!(
                    "promotable entry {} has no resolved issue",
                    candidate.entry.id
                ))
            })?
            .clone();

        // The checkpointed commit for this issue on this branch is the exact
        // merge source, not whatever the execution branch points at now.
        let checkpoint = self
            .checkpoints
            .checkpoints_for_issue(&issue_id)?
            .into_iter()
            .filter(|checkpoint| checkpoint.target_branch == target_branch)
            .last()
            .ok_or_else(|| {
                CoreError::Runtime(format!(
                    "no checkpoint for issue {issue_id} targeting {target_branch}"
                ))
            })?;

        if !self.engine.is_working_tree_clean(&self.repo_root) {
            return Ok(PromotionOutcome::DirtyWorkingTree);
        }

        self.queue.update_entry_status(
            &candidate.entry.id,
            QueueEntryStatus::Merging,
            None,
            None,
        )?;

        let tag_name = format!("{SAFETY_TAG_PREFIX}{}", candidate.entry.id);
        if let Err(error) = self.engine.create_safety_tag(&self.repo_root, &tag_name, "HEAD") {
            self.queue.update_entry_status(
                &candidate.entry.id,
                QueueEntryStatus::Failed,
                Some(error.to_string()),
                None,
            )?;
            return Err(vcs_error(error));
        }

        let message = merge_message(
            &issue_id,
            candidate.issue_title.as_deref(),
            candidate.entry.id.as_str(),
        );
        let options = MergeOptions {
            strategy: MergeStrategy::Squash,
            message: Some(message),
            allow_fast_forward: false,
        };

        match self
            .engine
            .merge_branch(&self.repo_root, &checkpoint.commit_sha, &options)
        {
            Ok(outcome) if outcome.merged => {
                self.queue.update_entry_status(
                    &candidate.entry.id,
                    QueueEntryStatus::Merged,
                    None,
                    outcome.merge_commit.clone(),
                )?;
                if checkpoint.review_status == ReviewStatus::Approved {
                    self.checkpoints
                        .update_review_status(&checkpoint.id, ReviewStatus::Merged)?;
                }
                let merge_commit = outcome.merge_commit.ok_or_else(|| {
                    CoreError::Runtime("merge reported success without a commit".to_owned())
                })?;
                tracing::info!(
                    entry_id = %candidate.entry.id,
                    issue_id = %issue_id,
                    merge_commit = %merge_commit,
                    "queue entry merged"
                );
                Ok(PromotionOutcome::Promoted {
                    entry_id: candidate.entry.id.clone(),
                    merge_commit,
                })
            }
            Ok(outcome) => {
                let detail = format!(
                    "merge conflicts in: {}",
                    outcome.conflicting_files.join(", ")
                );
                self.queue.update_entry_status(
                    &candidate.entry.id,
                    QueueEntryStatus::Failed,
                    Some(detail),
                    None,
                )?;
                tracing::warn!(
                    entry_id = %candidate.entry.id,
                    issue_id = %issue_id,
                    files = ?outcome.conflicting_files,
                    "queue entry failed with merge conflicts"
                );
                Ok(PromotionOutcome::Conflicted {
                    entry_id: candidate.entry.id.clone(),
                    conflicting_files: outcome.conflicting_files,
                })
            }
            Err(error) => {
                self.queue.update_entry_status(
                    &candidate.entry.id,
                    QueueEntryStatus::Failed,
                    Some(error.to_string()),
                    None,
                )?;
                Err(vcs_error(error))
            }
        }
    }
}

fn merge_message(
    issue_id: &foreman_core::IssueId,
    issue_title: Option<&str>,
    entry_id: &str,
) -> String {
    match issue_title {
        Some(title) => format!("{title} ({issue_id}, queue entry {entry_id})"),
        None => format!("Merge {issue_id} (queue entry {entry_id})"),
    }
}

fn vcs_error(error: VcsError) -> CoreError {
    CoreError::DependencyUnavailable(error.to_string())
}
