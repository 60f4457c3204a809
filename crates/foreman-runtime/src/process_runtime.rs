use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, RwLock};

use foreman_core::{
    CoreError, Execution, ExecutionId, ExecutionRequest, ExecutionRuntime, ExecutionStatus,
    IssueId,
};
use foreman_vcs::{CommandRunner, GitSyncEngine};

const BRANCH_PREFIX: &str = "fm/";
const STDERR_TAIL_BYTES: usize = 4096;
const ENV_ISSUE_ID: &str = "FOREMAN_ISSUE_ID";
const ENV_ISSUE_TITLE: &str = "FOREMAN_ISSUE_TITLE";
const ENV_BASE_BRANCH: &str = "FOREMAN_BASE_BRANCH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRuntimeConfig {
    pub repo_root: PathBuf,
    pub worktrees_root: PathBuf,
    pub agent_binary: PathBuf,
    pub agent_args: Vec<String>,
}

struct ManagedExecution {
    execution: Execution,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Runs one agent process per issue inside a dedicated worktree. The
/// scheduler polls [`ExecutionRuntime::execution`] for status; terminal
/// status is written exactly once, by the waiter task that owns the child
/// process.
pub struct ProcessExecutionRuntime<R: CommandRunner + 'static> {
    config: ExecutionRuntimeConfig,
    engine: Arc<GitSyncEngine<R>>,
    next_sequence: AtomicU64,
    sessions: Arc<RwLock<HashMap<ExecutionId, ManagedExecution>>>,
}

impl<R: CommandRunner + 'static> ProcessExecutionRuntime<R> {
    pub fn new(config: ExecutionRuntimeConfig, engine: GitSyncEngine<R>) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            next_sequence: AtomicU64::new(1),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn list_executions(&self) -> Vec<Execution> {
        self.sessions
            .read()
            .await
            .values()
            .map(|managed| managed.execution.clone())
            .collect()
    }

    async fn prepare_worktree(
        &self,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), CoreError> {
        let engine = self.engine.clone();
        let repo_root = self.config.repo_root.clone();
        let worktree_path = worktree_path.to_path_buf();
        let branch = branch.to_owned();
        let base_branch = base_branch.to_owned();
        tokio::task::spawn_blocking(move || {
            engine.create_worktree(&repo_root, &worktree_path, &branch, &base_branch)
        })
        .await
        .map_err(|error| CoreError::Runtime(format!("worktree task panicked: {error}")))?
        .map_err(|error| CoreError::Runtime(format!("failed to create worktree: {error}")))
    }

    fn spawn_agent(
        &self,
        issue_id: &IssueId,
        request: &ExecutionRequest,
        worktree_path: &Path,
    ) -> Result<tokio::process::Child, CoreError> {
        tokio::process::Command::new(&self.config.agent_binary)
            .args(&self.config.agent_args)
            .current_dir(worktree_path)
            .env(ENV_ISSUE_ID, issue_id.as_str())
            .env(ENV_ISSUE_TITLE, &request.issue_title)
            .env(ENV_BASE_BRANCH, &request.base_branch)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                CoreError::Runtime(format!(
                    "failed to spawn agent `{}`: {error}",
                    self.config.agent_binary.display()
                ))
            })
    }
}

#[async_trait]
impl<R: CommandRunner + 'static> ExecutionRuntime for ProcessExecutionRuntime<R> {
    async fn create_execution(
        &self,
        issue_id: &IssueId,
        request: ExecutionRequest,
    ) -> Result<Execution, CoreError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let execution_id = ExecutionId::new(format!("exec-{sequence}-{issue_id}"));
        let branch = format!("{BRANCH_PREFIX}{issue_id}");
        let worktree_path = self.config.worktrees_root.join(execution_id.as_str());

        self.prepare_worktree(&worktree_path, &branch, &request.base_branch)
            .await?;

        let mut child = self.spawn_agent(issue_id, &request, &worktree_path)?;
        let stderr = child.stderr.take();

        let execution = Execution {
            id: execution_id.clone(),
            issue_id: issue_id.clone(),
            status: ExecutionStatus::Running,
            worktree_path: Some(worktree_path.clone()),
            branch_name: Some(branch),
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            exit_code: None,
            error_message: None,
            files_changed: Vec::new(),
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        self.sessions.write().await.insert(
            execution_id.clone(),
            ManagedExecution {
                execution: execution.clone(),
                kill_tx: Some(kill_tx),
            },
        );

        let sessions = self.sessions.clone();
        let engine = self.engine.clone();
        let base_branch = request.base_branch.clone();
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(read_tail(stderr));

            let (status, exit_code) = tokio::select! {
                wait = child.wait() => match wait {
                    Ok(exit) => {
                        let code = exit.code();
                        if exit.success() {
                            (ExecutionStatus::Completed, code)
                        } else {
                            (ExecutionStatus::Failed, code)
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            error = %error,
                            "failed to wait on agent process"
                        );
                        (ExecutionStatus::Failed, None)
                    }
                },
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (ExecutionStatus::Cancelled, None)
                }
            };

            let stderr_tail = stderr_task.await.unwrap_or_default();
            let files_changed =
                collect_files_changed(&engine, &worktree_path, &base_branch).await;

            let mut sessions = sessions.write().await;
            if let Some(managed) = sessions.get_mut(&execution_id) {
                managed.execution.status = status;
                managed.execution.exit_code = exit_code;
                managed.execution.completed_at = Some(OffsetDateTime::now_utc());
                managed.execution.files_changed = files_changed;
                if status == ExecutionStatus::Failed && !stderr_tail.is_empty() {
                    managed.execution.error_message = Some(stderr_tail);
                }
                managed.kill_tx = None;
            }
            tracing::info!(execution_id = %execution_id, status = ?status, "agent exited");
        });

        Ok(execution)
    }

    async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<(), CoreError> {
        let mut sessions = self.sessions.write().await;
        let managed = sessions.get_mut(execution_id).ok_or_else(|| {
            CoreError::Runtime(format!("unknown execution {execution_id}"))
        })?;
        if let Some(kill_tx) = managed.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    async fn execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, CoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(execution_id)
            .map(|managed| managed.execution.clone()))
    }
}

async fn read_tail(stderr: Option<tokio::process::ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buffer = Vec::new();
    if stderr.read_to_end(&mut buffer).await.is_err() {
        return String::new();
    }
    let start = buffer.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buffer[start..]).trim().to_owned()
}

/// Files the execution changed relative to its base branch. Advisory
/// metadata: failure to compute it degrades to an empty list.
async fn collect_files_changed<R: CommandRunner + 'static>(
    engine: &Arc<GitSyncEngine<R>>,
    worktree_path: &Path,
    base_branch: &str,
) -> Vec<String> {
    let engine = engine.clone();
    let worktree_path = worktree_path.to_path_buf();
    let base_branch = base_branch.to_owned();
    let diff = tokio::task::spawn_blocking(move || {
        engine.diff(&worktree_path, &base_branch, "HEAD")
    })
    .await;

    match diff {
        Ok(Ok(diff)) => diff.files.into_iter().map(|file| file.path).collect(),
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "failed to diff execution worktree");
            Vec::new()
        }
        Err(error) => {
            tracing::warn!(error = %error, "diff task panicked");
            Vec::new()
        }
    }
}
