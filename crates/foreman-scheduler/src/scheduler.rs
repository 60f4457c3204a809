use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use foreman_core::{
    BacklogStore, CoreError, Execution, ExecutionId, ExecutionRequest, ExecutionRuntime,
    ExecutionStatus, GroupId, GroupService, GroupStatus, Issue, IssueId, IssueStatus,
    QualityGateRunner, SchedulerConfig, SchedulerConfigSource,
};

/// One tracked execution, keyed by execution id in the scheduler's owned
/// table. Nothing here is ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveExecution {
    issue_id: IssueId,
    group_id: Option<GroupId>,
    started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveExecutionDetail {
    pub execution_id: ExecutionId,
    pub issue_id: IssueId,
    pub group_id: Option<GroupId>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub active_executions: usize,
    pub active_execution_details: Vec<ActiveExecutionDetail>,
}

struct SchedulerLoop {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Polling execution scheduler. One instance per repository: issue selection
/// is deterministic, so a second concurrent scheduler would double-start the
/// same work (single-writer invariant).
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    lifecycle: Mutex<Option<SchedulerLoop>>,
}

impl Scheduler {
    pub fn new(
        backlog: Arc<dyn BacklogStore>,
        runtime: Arc<dyn ExecutionRuntime>,
        gates: Arc<dyn QualityGateRunner>,
        groups: Arc<dyn GroupService>,
        config: Arc<dyn SchedulerConfigSource>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backlog,
                runtime,
                gates,
                groups,
                config,
                active: Mutex::new(HashMap::new()),
                enabled: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Starts the poll loop. A no-op when already running.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.inner.enabled.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                // Re-read on every pass so interval changes apply without a
                // restart.
                let interval =
                    Duration::from_secs(inner.config.current().poll_interval_secs.max(1));
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(error) = inner.tick().await {
                            tracing::warn!(error = %error, "scheduler tick failed");
                        }
                    }
                }
            }
        });

        *lifecycle = Some(SchedulerLoop { shutdown_tx, task });
        tracing::info!("scheduler started");
    }

    /// Stops the poll loop and waits for the in-flight tick to finish.
    /// A no-op when not running.
    pub async fn stop(&self) {
        let Some(SchedulerLoop { shutdown_tx, task }) = self.lifecycle.lock().await.take() else {
            return;
        };
        self.inner.enabled.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(true);
        let _ = task.await;
        tracing::info!("scheduler stopped");
    }

    /// One unit of scheduler work: reconcile finished executions, then fill
    /// remaining capacity. Exposed for driving the scheduler from tests and
    /// manual tooling; the poll loop calls the same path.
    pub async fn tick(&self) -> Result<(), CoreError> {
        self.inner.tick().await
    }

    /// Read-only operational snapshot.
    pub async fn status(&self) -> SchedulerStatus {
        let active = self.inner.active.lock().await;
        let mut details: Vec<ActiveExecutionDetail> = active
            .iter()
            .map(|(execution_id, record)| ActiveExecutionDetail {
                execution_id: execution_id.clone(),
                issue_id: record.issue_id.clone(),
                group_id: record.group_id.clone(),
                started_at: record.started_at,
            })
            .collect();
        details.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        SchedulerStatus {
            enabled: self.inner.enabled.load(Ordering::SeqCst),
            active_executions: details.len(),
            active_execution_details: details,
        }
    }
}

struct SchedulerInner {
    backlog: Arc<dyn BacklogStore>,
    runtime: Arc<dyn ExecutionRuntime>,
    gates: Arc<dyn QualityGateRunner>,
    groups: Arc<dyn GroupService>,
    config: Arc<dyn SchedulerConfigSource>,
    active: Mutex<HashMap<ExecutionId, ActiveExecution>>,
    enabled: AtomicBool,
}

impl SchedulerInner {
    async fn tick(&self) -> Result<(), CoreError> {
        self.reconcile().await;

        let config = self.config.current();
        let mut active = self.active.lock().await;
        if active.len() >= config.max_concurrency {
            return Ok(());
        }

        // Issues skipped this tick (paused group, failed start) must not be
        // re-selected until the next tick, or a paused group would spin the
        // selection loop forever.
        let mut skipped: HashSet<IssueId> = HashSet::new();
        while active.len() < config.max_concurrency {
            let Some(issue) = self.select_next_issue(&active, &skipped)? else {
                break;
            };
            match self.start_execution(&issue, &config).await {
                Ok(Some((execution_id, record))) => {
                    active.insert(execution_id, record);
                }
                Ok(None) => {
                    skipped.insert(issue.id.clone());
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        issue_id = %issue.id,
                        "failed to start execution; routing issue to needs_review"
                    );
                    if let Err(update_error) = self
                        .backlog
                        .update_issue_status(&issue.id, IssueStatus::NeedsReview)
                    {
                        tracing::warn!(
                            error = %update_error,
                            issue_id = %issue.id,
                            "failed to mark issue needs_review after start failure"
                        );
                    }
                    skipped.insert(issue.id.clone());
                }
            }
        }

        Ok(())
    }

    /// Deterministic, total-ordered selection: ready issues, minus those
    /// already executing, minus those whose group already has an active
    /// execution, sorted by priority ascending then created_at ascending.
    fn select_next_issue(
        &self,
        active: &HashMap<ExecutionId, ActiveExecution>,
        skipped: &HashSet<IssueId>,
    ) -> Result<Option<Issue>, CoreError> {
        let active_issues: HashSet<&IssueId> =
            active.values().map(|record| &record.issue_id).collect();
        let active_groups: HashSet<&GroupId> = active
            .values()
            .filter_map(|record| record.group_id.as_ref())
            .collect();

        let mut eligible: Vec<Issue> = self
            .backlog
            .ready_issues()?
            .into_iter()
            .filter(|issue| !active_issues.contains(&issue.id) && !skipped.contains(&issue.id))
            .filter(|issue| match &issue.group_id {
                Some(group_id) => !active_groups.contains(group_id),
                None => true,
            })
            .collect();

        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(eligible.into_iter().next())
    }

    /// Starts one execution. Returns `None` when the issue's group is paused
    /// (silent skip, retried on a later tick).
    async fn start_execution(
        &self,
        issue: &Issue,
        config: &SchedulerConfig,
    ) -> Result<Option<(ExecutionId, ActiveExecution)>, CoreError> {
        let group = self.groups.group_for_issue(&issue.id)?;
        if let Some(group) = &group {
            if group.status == GroupStatus::Paused {
                tracing::debug!(
                    issue_id = %issue.id,
                    group_id = %group.id,
                    "skipping issue in paused group"
                );
                return Ok(None);
            }
        }

        self.backlog
            .update_issue_status(&issue.id, IssueStatus::InProgress)?;

        let base_branch = group
            .as_ref()
            .map(|group| group.working_branch.clone())
            .unwrap_or_else(|| config.integration_branch.clone());
        let execution = self
            .runtime
            .create_execution(
                &issue.id,
                ExecutionRequest {
                    base_branch,
                    issue_title: issue.title.clone(),
                    issue_content: issue.content.clone(),
                },
            )
            .await?;

        tracing::info!(
            issue_id = %issue.id,
            execution_id = %execution.id,
            branch = execution.branch_name.as_deref().unwrap_or(""),
            "execution started"
        );

        let record = ActiveExecution {
            issue_id: issue.id.clone(),
            group_id: group.map(|group| group.id),
            started_at: execution.started_at,
        };
        Ok(Some((execution.id, record)))
    }

    /// Polls every tracked execution and applies lifecycle updates for the
    /// terminal ones. The active entry is removed even when the update
    /// fails, so nothing can stay stuck.
    async fn reconcile(&self) {
        let snapshot: Vec<(ExecutionId, ActiveExecution)> = {
            let active = self.active.lock().await;
            active
                .iter()
                .map(|(execution_id, record)| (execution_id.clone(), record.clone()))
                .collect()
        };

        for (execution_id, record) in snapshot {
            match self.runtime.execution(&execution_id).await {
                Ok(Some(execution)) if execution.status.is_terminal() => {
                    if let Err(error) = self.handle_completion(&execution).await {
                        tracing::warn!(
                            error = %error,
                            execution_id = %execution_id,
                            "failed to apply completion lifecycle update"
                        );
                    }
                    self.active.lock().await.remove(&execution_id);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        issue_id = %record.issue_id,
                        "runtime no longer tracks execution; routing issue to needs_review"
                    );
                    if let Err(error) = self
                        .backlog
                        .update_issue_status(&record.issue_id, IssueStatus::NeedsReview)
                    {
                        tracing::warn!(
                            error = %error,
                            issue_id = %record.issue_id,
                            "failed to mark issue needs_review for lost execution"
                        );
                    }
                    self.active.lock().await.remove(&execution_id);
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        execution_id = %execution_id,
                        "failed to poll execution; will retry next tick"
                    );
                }
            }
        }
    }

    /// Terminal-status state machine: completed runs go through quality
    /// gates (when enabled), failures need review, cancellations reopen the
    /// issue for a future tick.
    async fn handle_completion(&self, execution: &Execution) -> Result<(), CoreError> {
        let next_status = match execution.status {
            ExecutionStatus::Completed => {
                let config = self.config.current();
                if config.quality_gates_enabled {
                    self.quality_gate_verdict(execution, &config).await
                } else {
                    IssueStatus::Closed
                }
            }
            ExecutionStatus::Failed => IssueStatus::NeedsReview,
            ExecutionStatus::Cancelled | ExecutionStatus::Stopped => IssueStatus::Open,
            ExecutionStatus::Pending | ExecutionStatus::Running => return Ok(()),
        };

        tracing::info!(
            execution_id = %execution.id,
            issue_id = %execution.issue_id,
            status = ?execution.status,
            issue_status = ?next_status,
            "execution finished"
        );
        self.backlog
            .update_issue_status(&execution.issue_id, next_status)
    }

    async fn quality_gate_verdict(
        &self,
        execution: &Execution,
        config: &SchedulerConfig,
    ) -> IssueStatus {
        let Some(working_dir) = execution.worktree_path.as_deref() else {
            tracing::warn!(
                execution_id = %execution.id,
                "completed execution has no worktree for quality gates"
            );
            return IssueStatus::NeedsReview;
        };

        match self
            .gates
            .run_checks(&execution.id, &config.quality_gates, working_dir)
            .await
        {
            Ok(report) if report.passed => IssueStatus::Closed,
            Ok(report) => {
                tracing::info!(
                    execution_id = %execution.id,
                    failed = report.checks.iter().filter(|check| !check.passed).count(),
                    "quality gates failed"
                );
                IssueStatus::NeedsReview
            }
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    execution_id = %execution.id,
                    "quality gate invocation failed"
                );
                IssueStatus::NeedsReview
            }
        }
    }
}
