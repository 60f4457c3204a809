//! Polling scheduler that drives issue lifecycles through isolated
//! executions under a concurrency budget.

pub mod scheduler;

#[cfg(test)]
mod tests;

pub use scheduler::{ActiveExecutionDetail, Scheduler, SchedulerStatus};
