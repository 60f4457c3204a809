use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use foreman_core::{
    CoreError, ExecutionId, QualityGateCheck, QualityGateConfig, QualityGateReport,
    QualityGateRunner,
};

const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Runs each configured gate command inside the execution's worktree.
/// Commands are split on whitespace, not through a shell.
#[derive(Debug, Default)]
pub struct CommandQualityGateRunner;

#[async_trait]
impl QualityGateRunner for CommandQualityGateRunner {
    async fn run_checks(
        &self,
        execution_id: &ExecutionId,
        config: &QualityGateConfig,
        working_dir: &Path,
    ) -> Result<QualityGateReport, CoreError> {
        let timeout_secs = if config.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            config.timeout_secs
        };

        let mut checks = Vec::with_capacity(config.commands.len());
        for command in &config.commands {
            let mut words = command.split_whitespace();
            let Some(program) = words.next() else {
                continue;
            };

            let spawned = tokio::process::Command::new(program)
                .args(words)
                .current_dir(working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();

            let check = match tokio::time::timeout(Duration::from_secs(timeout_secs), spawned)
                .await
            {
                Ok(Ok(status)) => QualityGateCheck {
                    command: command.clone(),
                    exit_code: status.code(),
                    passed: status.success(),
                },
                Ok(Err(error)) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        command = %command,
                        error = %error,
                        "quality gate command failed to spawn"
                    );
                    QualityGateCheck {
                        command: command.clone(),
                        exit_code: None,
                        passed: false,
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        command = %command,
                        timeout_secs,
                        "quality gate command timed out"
                    );
                    QualityGateCheck {
                        command: command.clone(),
                        exit_code: None,
                        passed: false,
                    }
                }
            };
            checks.push(check);
        }

        Ok(QualityGateReport {
            passed: checks.iter().all(|check| check.passed),
            checks,
        })
    }
}
