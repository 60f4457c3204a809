//! Process-based execution runtime: one agent process per issue, isolated in
//! its own worktree, plus the quality gate runner used after completion.

pub mod gates;
pub mod process_runtime;


pub use gates::CommandQualityGateRunner;
pub use process_runtime::{ExecutionRuntimeConfig, ProcessExecutionRuntime};
