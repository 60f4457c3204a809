//! TOML configuration for the foreman pipeline: load, normalize, and
//! re-read on every scheduler tick so changes apply without a restart.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foreman_core::{QualityGateConfig, SchedulerConfig, SchedulerConfigSource};

pub const ENV_FOREMAN_CONFIG: &str = "FOREMAN_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./foreman.toml";
const DEFAULT_DATABASE_PATH: &str = ".foreman/backlog.db";
const DEFAULT_GIT_BINARY: &str = "git";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const MAX_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENCY: usize = 2;
const DEFAULT_INTEGRATION_BRANCH: &str = "main";
const DEFAULT_QUALITY_GATE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_AGENT_BINARY: &str = "foreman-agent";
const DEFAULT_WORKTREES_DIR: &str = ".foreman/worktrees";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub database: DatabaseConfigToml,
    #[serde(default)]
    pub git: GitConfigToml,
    #[serde(default)]
    pub scheduler: SchedulerConfigToml,
    #[serde(default)]
    pub runtime: RuntimeConfigToml,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            database: DatabaseConfigToml::default(),
            git: GitConfigToml::default(),
            scheduler: SchedulerConfigToml::default(),
            runtime: RuntimeConfigToml::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfigToml {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfigToml {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfigToml {
    #[serde(default = "default_git_binary")]
    pub binary: String,
}

impl Default for GitConfigToml {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfigToml {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    #[serde(default)]
    pub quality_gates_enabled: bool,
    #[serde(default)]
    pub quality_gate_commands: Vec<String>,
    #[serde(default = "default_quality_gate_timeout_secs")]
    pub quality_gate_timeout_secs: u64,
}

impl Default for SchedulerConfigToml {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrency: default_max_concurrency(),
            integration_branch: default_integration_branch(),
            quality_gates_enabled: false,
            quality_gate_commands: Vec::new(),
            quality_gate_timeout_secs: default_quality_gate_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfigToml {
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    #[serde(default)]
    pub agent_args: Vec<String>,
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
}

impl Default for RuntimeConfigToml {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            agent_args: Vec::new(),
            worktrees_dir: default_worktrees_dir(),
        }
    }
}

impl ForemanConfig {
    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_root().join(&self.database.path)
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.workspace_root().join(&self.runtime.worktrees_dir)
    }

    /// The scheduler's view of this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: self.scheduler.poll_interval_secs,
            max_concurrency: self.scheduler.max_concurrency,
            integration_branch: self.scheduler.integration_branch.clone(),
            quality_gates_enabled: self.scheduler.quality_gates_enabled,
            quality_gates: QualityGateConfig {
                commands: self.scheduler.quality_gate_commands.clone(),
                timeout_secs: self.scheduler.quality_gate_timeout_secs,
            },
            worktrees_root: self.worktrees_root(),
        }
    }
}

pub fn config_path_from_env() -> PathBuf {
    std::env::var(ENV_FOREMAN_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads and normalizes a configuration file. A missing file yields the
/// defaults; a malformed file is an error.
pub fn load_config(path: &Path) -> Result<ForemanConfig, ConfigError> {
    if !path.exists() {
        return Ok(normalize(ForemanConfig::default()));
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|error| ConfigError::Message(format!("read {}: {error}", path.display())))?;
    let config: ForemanConfig = toml::from_str(&raw)
        .map_err(|error| ConfigError::Message(format!("parse {}: {error}", path.display())))?;
    Ok(normalize(config))
}

/// Clamps out-of-range values instead of rejecting them, so a fat-fingered
/// edit cannot take the pipeline down.
fn normalize(mut config: ForemanConfig) -> ForemanConfig {
    let clamped_interval = config
        .scheduler
        .poll_interval_secs
        .clamp(1, MAX_POLL_INTERVAL_SECS);
    if clamped_interval != config.scheduler.poll_interval_secs {
        tracing::warn!(
            configured = config.scheduler.poll_interval_secs,
            effective = clamped_interval,
            "scheduler poll interval clamped"
        );
        config.scheduler.poll_interval_secs = clamped_interval;
    }

    if config.scheduler.max_concurrency == 0 {
        tracing::warn!("scheduler max_concurrency of 0 raised to 1");
        config.scheduler.max_concurrency = 1;
    }

    if config.scheduler.integration_branch.trim().is_empty() {
        config.scheduler.integration_branch = default_integration_branch();
    }

    config
}

/// Re-reads the configuration file on every call, falling back to the last
/// good configuration when the file is unreadable. The scheduler consults
/// this on each tick boundary.
pub struct FileConfigSource {
    path: PathBuf,
    last_good: RwLock<SchedulerConfig>,
}

impl FileConfigSource {
    pub fn new(path: PathBuf, initial: SchedulerConfig) -> Self {
        Self {
            path,
            last_good: RwLock::new(initial),
        }
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let initial = load_config(&path)?.scheduler_config();
        Ok(Self::new(path, initial))
    }
}

impl SchedulerConfigSource for FileConfigSource {
    fn current(&self) -> SchedulerConfig {
        match load_config(&self.path) {
            Ok(config) => {
                let scheduler = config.scheduler_config();
                if let Ok(mut last_good) = self.last_good.write() {
                    *last_good = scheduler.clone();
                }
                scheduler
            }
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    path = %self.path.display(),
                    "configuration reload failed; keeping last good configuration"
                );
                self.last_good
                    .read()
                    .map(|last_good| last_good.clone())
                    .unwrap_or_default()
            }
        }
    }
}

fn default_workspace() -> String {
    ".".to_owned()
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_owned()
}

fn default_git_binary() -> String {
    DEFAULT_GIT_BINARY.to_owned()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_integration_branch() -> String {
    DEFAULT_INTEGRATION_BRANCH.to_owned()
}

fn default_quality_gate_timeout_secs() -> u64 {
    DEFAULT_QUALITY_GATE_TIMEOUT_SECS
}

fn default_agent_binary() -> String {
    DEFAULT_AGENT_BINARY.to_owned()
}

fn default_worktrees_dir() -> String {
    DEFAULT_WORKTREES_DIR.to_owned()
}
