use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failing git invocation is wrapped into one of these; raw process
/// errors never escape the engine.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed (`{command}`): {detail}")]
    CommandFailed {
        command: String,
        stdout: String,
        stderr: String,
        detail: String,
    },
    #[error("git produced malformed output: {0}")]
    MalformedOutput(String),
    #[error("'{0}' is not a valid commit identifier")]
    InvalidCommit(String),
    #[error("git unavailable: {0}")]
    Unavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Other,
}

impl DiffStatus {
    pub fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('A') => Self::Added,
            Some('M') => Self::Modified,
            Some('D') => Self::Deleted,
            Some('R') => Self::Renamed,
            Some('C') => Self::Copied,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files: Vec<DiffFile>,
    pub additions: u64,
    pub deletions: u64,
}

/// Static conflict approximation: files changed on both sides since the merge
/// base. Advisory only — a listed file does not necessarily conflict line by
/// line, and renames can escape the intersection entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub merge_base: String,
    pub conflicting_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CherryPickOutcome {
    pub success: bool,
    pub conflicting_commit: Option<String>,
    pub conflicting_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedFile {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    Merge,
    Squash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub message: Option<String>,
    pub allow_fast_forward: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Merge,
            message: None,
            allow_fast_forward: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merged: bool,
    pub fast_forwarded: bool,
    pub merge_commit: Option<String>,
    pub conflicting_files: Vec<String>,
}

/// Commit SHAs are only trusted after matching the full 40-hex form, so
/// malformed upstream data can never be spliced into an argument vector as
/// something else.
pub fn is_commit_sha(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|ch| ch.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_sha_validation_requires_full_forty_hex() {
        assert!(is_commit_sha(&"a1b2c3d4".repeat(5)));
        assert!(!is_commit_sha("HEAD"));
        assert!(!is_commit_sha(&"a".repeat(39)));
        assert!(!is_commit_sha(&"g".repeat(40)));
        assert!(!is_commit_sha(""));
    }

    #[test]
    fn diff_status_codes_map_including_rename_scores() {
        assert_eq!(DiffStatus::from_code("A"), DiffStatus::Added);
        assert_eq!(DiffStatus::from_code("M"), DiffStatus::Modified);
        assert_eq!(DiffStatus::from_code("D"), DiffStatus::Deleted);
        assert_eq!(DiffStatus::from_code("R100"), DiffStatus::Renamed);
        assert_eq!(DiffStatus::from_code("C75"), DiffStatus::Copied);
        assert_eq!(DiffStatus::from_code("X"), DiffStatus::Other);
    }
}
