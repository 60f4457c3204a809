use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::identifiers::{ExecutionId, IssueId};
use crate::model::{Execution, Group, Stack};

/// Request handed to the execution runtime when the scheduler starts work on
/// an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub base_branch: String,
    pub issue_title: String,
    pub issue_content: String,
}

/// Spawns and tracks the out-of-process agent working on one issue. Terminal
/// status must be reported exactly once per execution; the scheduler polls
/// `execution` on every tick rather than waiting for callbacks.
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    async fn create_execution(
        &self,
        issue_id: &IssueId,
        request: ExecutionRequest,
    ) -> Result<Execution, CoreError>;

    async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<(), CoreError>;

    /// Current snapshot of the execution, or `None` once the runtime has
    /// forgotten it.
    async fn execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityGateConfig {
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateCheck {
    pub command: String,
    pub exit_code: Option<i32>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateReport {
    pub passed: bool,
    pub checks: Vec<QualityGateCheck>,
}

/// Runs the configured quality gates inside a completed execution's worktree.
#[async_trait]
pub trait QualityGateRunner: Send + Sync {
    async fn run_checks(
        &self,
        execution_id: &ExecutionId,
        config: &QualityGateConfig,
        working_dir: &Path,
    ) -> Result<QualityGateReport, CoreError>;
}

/// Group and stack lookups over the backlog.
pub trait GroupService: Send + Sync {
    fn group_for_issue(&self, issue_id: &IssueId) -> Result<Option<Group>, CoreError>;
    fn list_stacks(&self) -> Result<Vec<Stack>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub max_concurrency: usize,
    pub integration_branch: String,
    pub quality_gates_enabled: bool,
    pub quality_gates: QualityGateConfig,
    pub worktrees_root: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_concurrency: 2,
            integration_branch: "main".to_owned(),
            quality_gates_enabled: false,
            quality_gates: QualityGateConfig::default(),
            worktrees_root: PathBuf::from(".foreman/worktrees"),
        }
    }
}

/// Source of the scheduler configuration, consulted on every tick boundary so
/// concurrency and interval changes apply without a restart.
pub trait SchedulerConfigSource: Send + Sync {
    fn current(&self) -> SchedulerConfig;
}

impl SchedulerConfigSource for SchedulerConfig {
    fn current(&self) -> SchedulerConfig {
        self.clone()
    }
}
