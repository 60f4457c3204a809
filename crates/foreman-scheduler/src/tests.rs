use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::macros::datetime;

use foreman_core::test_support::{issue_fixture, InMemoryBacklog};
use foreman_core::{
    CoreError, Execution, ExecutionId, ExecutionRequest, ExecutionRuntime, ExecutionStatus, Group,
    GroupId, GroupStatus, IssueId, IssueStatus, QualityGateConfig, QualityGateReport,
    QualityGateRunner, SchedulerConfig, SchedulerConfigSource,
};

use crate::scheduler::Scheduler;

struct FakeRuntime {
    next_id: AtomicU64,
    executions: Mutex<HashMap<ExecutionId, Execution>>,
    created_order: Mutex<Vec<IssueId>>,
    fail_for: Mutex<HashSet<IssueId>>,
}

impl FakeRuntime {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            executions: Mutex::new(HashMap::new()),
            created_order: Mutex::new(Vec::new()),
            fail_for: Mutex::new(HashSet::new()),
        }
    }

    fn fail_start_for(&self, issue_id: &str) {
        self.fail_for
            .lock()
            .expect("lock")
            .insert(IssueId::new(issue_id));
    }

    fn created_issues(&self) -> Vec<IssueId> {
        self.created_order.lock().expect("lock").clone()
    }

    fn finish(&self, execution_id: &ExecutionId, status: ExecutionStatus, exit_code: i32) {
        let mut executions = self.executions.lock().expect("lock");
        let execution = executions
            .get_mut(execution_id)
            .expect("execution tracked by fake runtime");
        execution.status = status;
        execution.exit_code = Some(exit_code);
        execution.completed_at = Some(datetime!(2025-06-01 12:30 UTC));
    }

    fn finish_all(&self, status: ExecutionStatus) {
        let ids: Vec<ExecutionId> = self
            .executions
            .lock()
            .expect("lock")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.finish(&id, status, 0);
        }
    }

    fn execution_for_issue(&self, issue_id: &str) -> Option<ExecutionId> {
        self.executions
            .lock()
            .expect("lock")
            .values()
            .find(|execution| execution.issue_id == IssueId::new(issue_id))
            .map(|execution| execution.id.clone())
    }

    fn forget(&self, execution_id: &ExecutionId) {
        self.executions.lock().expect("lock").remove(execution_id);
    }
}

#[async_trait]
impl ExecutionRuntime for FakeRuntime {
    async fn create_execution(
        &self,
        issue_id: &IssueId,
        _request: ExecutionRequest,
    ) -> Result<Execution, CoreError> {
        if self.fail_for.lock().expect("lock").contains(issue_id) {
            return Err(CoreError::Runtime(format!(
                "scripted start failure for {issue_id}"
            )));
        }

        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst);
        let execution = Execution {
            id: ExecutionId::new(format!("exec-{sequence}")),
            issue_id: issue_id.clone(),
            status: ExecutionStatus::Running,
            worktree_path: Some(PathBuf::from(format!("/tmp/foreman/worktrees/{issue_id}"))),
            branch_name: Some(format!("fm/{issue_id}")),
            started_at: datetime!(2025-06-01 12:00 UTC) + Duration::from_secs(sequence),
            completed_at: None,
            exit_code: None,
            error_message: None,
            files_changed: Vec::new(),
        };
        self.executions
            .lock()
            .expect("lock")
            .insert(execution.id.clone(), execution.clone());
        self.created_order
            .lock()
            .expect("lock")
            .push(issue_id.clone());
        Ok(execution)
    }

    async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<(), CoreError> {
        self.finish(execution_id, ExecutionStatus::Cancelled, 130);
        Ok(())
    }

    async fn execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, CoreError> {
        Ok(self
            .executions
            .lock()
            .expect("lock")
            .get(execution_id)
            .cloned())
    }
}

struct FakeGates {
    pass: Mutex<bool>,
    calls: Mutex<Vec<(ExecutionId, PathBuf)>>,
}

impl FakeGates {
    fn passing() -> Self {
        Self {
            pass: Mutex::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn set_pass(&self, pass: bool) {
        *self.pass.lock().expect("lock") = pass;
    }

    fn calls(&self) -> Vec<(ExecutionId, PathBuf)> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl QualityGateRunner for FakeGates {
    async fn run_checks(
        &self,
        execution_id: &ExecutionId,
        _config: &QualityGateConfig,
        working_dir: &Path,
    ) -> Result<QualityGateReport, CoreError> {
        self.calls
            .lock()
            .expect("lock")
            .push((execution_id.clone(), working_dir.to_path_buf()));
        Ok(QualityGateReport {
            passed: *self.pass.lock().expect("lock"),
            checks: Vec::new(),
        })
    }
}

struct MutableConfigSource {
    config: Mutex<SchedulerConfig>,
}

impl MutableConfigSource {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    fn set_max_concurrency(&self, max_concurrency: usize) {
        self.config.lock().expect("lock").max_concurrency = max_concurrency;
    }
}

impl SchedulerConfigSource for MutableConfigSource {
    fn current(&self) -> SchedulerConfig {
        self.config.lock().expect("lock").clone()
    }
}

struct Fixture {
    backlog: Arc<InMemoryBacklog>,
    runtime: Arc<FakeRuntime>,
    gates: Arc<FakeGates>,
    config: Arc<MutableConfigSource>,
    scheduler: Scheduler,
}

fn fixture(config: SchedulerConfig) -> Fixture {
    let backlog = Arc::new(InMemoryBacklog::new());
    let runtime = Arc::new(FakeRuntime::new());
    let gates = Arc::new(FakeGates::passing());
    let config = Arc::new(MutableConfigSource::new(config));
    let scheduler = Scheduler::new(
        backlog.clone(),
        runtime.clone(),
        gates.clone(),
        backlog.clone(),
        config.clone(),
    );
    Fixture {
        backlog,
        runtime,
        gates,
        config,
        scheduler,
    }
}

fn default_config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_secs: 1,
        max_concurrency,
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn selection_prefers_priority_then_age() {
    let fx = fixture(default_config(1));
    fx.backlog.add_issue(issue_fixture(
        "prio-2",
        2,
        datetime!(2025-06-01 08:00 UTC),
    ));
    fx.backlog.add_issue(issue_fixture(
        "zero-newer",
        0,
        datetime!(2025-06-01 08:01 UTC),
    ));
    fx.backlog.add_issue(issue_fixture(
        "zero-older",
        0,
        datetime!(2025-06-01 08:00 UTC),
    ));
    fx.backlog.add_issue(issue_fixture(
        "prio-1",
        1,
        datetime!(2025-06-01 08:00 UTC),
    ));

    fx.scheduler.tick().await.expect("tick");

    assert_eq!(fx.runtime.created_issues(), vec![IssueId::new("zero-older")]);
    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("zero-older")),
        Some(IssueStatus::InProgress)
    );
}

#[tokio::test]
async fn concurrency_ceiling_caps_started_executions() {
    let fx = fixture(default_config(2));
    for index in 0..5 {
        fx.backlog.add_issue(issue_fixture(
            &format!("issue-{index}"),
            1,
            datetime!(2025-06-01 08:00 UTC) + Duration::from_secs(index),
        ));
    }

    fx.scheduler.tick().await.expect("tick");

    let status = fx.scheduler.status().await;
    assert_eq!(status.active_executions, 2);
    let open = (0..5)
        .filter(|index| {
            fx.backlog
                .issue_status(&IssueId::new(format!("issue-{index}")))
                == Some(IssueStatus::Open)
        })
        .count();
    assert_eq!(open, 3);
}

#[tokio::test]
async fn issues_in_one_group_never_run_concurrently() {
    let fx = fixture(default_config(4));
    fx.backlog.add_group(Group {
        id: GroupId::new("group-1"),
        name: "payments".to_owned(),
        working_branch: "group/payments".to_owned(),
        status: GroupStatus::Active,
    });
    for id in ["grouped-a", "grouped-b"] {
        let mut issue = issue_fixture(id, 0, datetime!(2025-06-01 08:00 UTC));
        issue.group_id = Some(GroupId::new("group-1"));
        fx.backlog.add_issue(issue);
    }

    fx.scheduler.tick().await.expect("tick");
    assert_eq!(fx.runtime.created_issues(), vec![IssueId::new("grouped-a")]);

    // Still blocked on the second tick while the first execution runs.
    fx.scheduler.tick().await.expect("tick");
    assert_eq!(fx.runtime.created_issues().len(), 1);
    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("grouped-b")),
        Some(IssueStatus::Open)
    );
}

#[tokio::test]
async fn paused_group_is_skipped_silently() {
    let fx = fixture(default_config(2));
    fx.backlog.add_group(Group {
        id: GroupId::new("group-1"),
        name: "paused".to_owned(),
        working_branch: "group/paused".to_owned(),
        status: GroupStatus::Paused,
    });
    let mut paused = issue_fixture("paused-issue", 0, datetime!(2025-06-01 08:00 UTC));
    paused.group_id = Some(GroupId::new("group-1"));
    fx.backlog.add_issue(paused);
    fx.backlog.add_issue(issue_fixture(
        "free-issue",
        1,
        datetime!(2025-06-01 08:00 UTC),
    ));

    fx.scheduler.tick().await.expect("tick");

    // The paused issue stays open and untouched; capacity flows past it.
    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("paused-issue")),
        Some(IssueStatus::Open)
    );
    assert_eq!(fx.runtime.created_issues(), vec![IssueId::new("free-issue")]);
}

#[tokio::test]
async fn completed_execution_without_gates_closes_issue() {
    let fx = fixture(default_config(1));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    fx.runtime.finish_all(ExecutionStatus::Completed);
    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("issue-1")),
        Some(IssueStatus::Closed)
    );
    assert_eq!(fx.scheduler.status().await.active_executions, 0);
    assert!(fx.gates.calls().is_empty());
}

#[tokio::test]
async fn failed_execution_routes_issue_to_needs_review() {
    let fx = fixture(default_config(1));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    fx.runtime.finish_all(ExecutionStatus::Failed);
    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("issue-1")),
        Some(IssueStatus::NeedsReview)
    );
}

#[tokio::test]
async fn cancelled_execution_reopens_issue_for_retry() {
    let fx = fixture(default_config(1));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    fx.runtime.finish_all(ExecutionStatus::Cancelled);
    fx.scheduler.tick().await.expect("tick");

    // Reopened and immediately eligible again: the same tick that reconciled
    // the cancellation may restart it.
    let created = fx.runtime.created_issues();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|id| *id == IssueId::new("issue-1")));
}

#[tokio::test]
async fn quality_gates_gate_the_terminal_issue_status() {
    let mut config = default_config(1);
    config.quality_gates_enabled = true;
    let fx = fixture(config);
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    fx.runtime.finish_all(ExecutionStatus::Completed);
    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("issue-1")),
        Some(IssueStatus::Closed)
    );
    let calls = fx.gates.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].1,
        PathBuf::from("/tmp/foreman/worktrees/issue-1")
    );
}

#[tokio::test]
async fn failing_quality_gates_route_issue_to_needs_review() {
    let mut config = default_config(1);
    config.quality_gates_enabled = true;
    let fx = fixture(config);
    fx.gates.set_pass(false);
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    fx.runtime.finish_all(ExecutionStatus::Completed);
    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("issue-1")),
        Some(IssueStatus::NeedsReview)
    );
}

#[tokio::test]
async fn start_failure_marks_issue_needs_review_and_continues() {
    let fx = fixture(default_config(2));
    fx.runtime.fail_start_for("broken");
    fx.backlog
        .add_issue(issue_fixture("broken", 0, datetime!(2025-06-01 08:00 UTC)));
    fx.backlog
        .add_issue(issue_fixture("healthy", 1, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("broken")),
        Some(IssueStatus::NeedsReview)
    );
    assert_eq!(fx.runtime.created_issues(), vec![IssueId::new("healthy")]);
}

#[tokio::test]
async fn lost_execution_is_cleared_and_issue_needs_review() {
    let fx = fixture(default_config(1));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.tick().await.expect("tick");
    let execution_id = fx
        .runtime
        .execution_for_issue("issue-1")
        .expect("execution started");
    fx.runtime.forget(&execution_id);
    fx.scheduler.tick().await.expect("tick");

    assert_eq!(
        fx.backlog.issue_status(&IssueId::new("issue-1")),
        Some(IssueStatus::NeedsReview)
    );
    // The slot is free again; nothing else is eligible to fill it.
    assert_eq!(fx.scheduler.status().await.active_executions, 0);
}

#[tokio::test]
async fn concurrency_raise_applies_on_the_next_tick() {
    let fx = fixture(default_config(1));
    for index in 0..3 {
        fx.backlog.add_issue(issue_fixture(
            &format!("issue-{index}"),
            1,
            datetime!(2025-06-01 08:00 UTC) + Duration::from_secs(index),
        ));
    }

    fx.scheduler.tick().await.expect("tick");
    assert_eq!(fx.scheduler.status().await.active_executions, 1);

    fx.config.set_max_concurrency(3);
    fx.scheduler.tick().await.expect("tick");
    assert_eq!(fx.scheduler.status().await.active_executions, 3);
}

#[tokio::test]
async fn status_reports_active_execution_details() {
    let fx = fixture(default_config(2));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    let before = fx.scheduler.status().await;
    assert!(!before.enabled);
    assert_eq!(before.active_executions, 0);

    fx.scheduler.tick().await.expect("tick");
    let after = fx.scheduler.status().await;
    assert_eq!(after.active_executions, 1);
    assert_eq!(
        after.active_execution_details[0].issue_id,
        IssueId::new("issue-1")
    );
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_and_loop_ticks_until_stopped() {
    let fx = fixture(default_config(1));
    fx.backlog
        .add_issue(issue_fixture("issue-1", 0, datetime!(2025-06-01 08:00 UTC)));

    fx.scheduler.start().await;
    fx.scheduler.start().await;
    assert!(fx.scheduler.status().await.enabled);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(fx.runtime.created_issues(), vec![IssueId::new("issue-1")]);

    fx.scheduler.stop().await;
    fx.scheduler.stop().await;
    assert!(!fx.scheduler.status().await.enabled);
}
