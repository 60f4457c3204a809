//! Worktree and sync engine over the git CLI. All invocations go through a
//! [`CommandRunner`] argument vector, never a shell.

pub mod engine;
pub mod interface;
pub mod runner;

pub use engine::GitSyncEngine;
pub use interface::{
    is_commit_sha, CherryPickOutcome, CommitInfo, ConflictReport, DiffFile, DiffStatus,
    DiffSummary, MergeOptions, MergeOutcome, MergeStrategy, UncommittedFile, VcsError,
};
pub use runner::{CommandRunner, ProcessCommandRunner};
