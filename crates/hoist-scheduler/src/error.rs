//! Scheduler error types.

use thiserror::Error;

/// Dependency graph problems. All of them are configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("job {0:?} depends on itself")]
    SelfDependency(String),

    #[error("job {job:?} depends on unknown job {dependency:?}")]
    UnknownDependency { job: String, dependency: String },

    #[error("dependency cycle between jobs: {}", .jobs.join(", "))]
    Cycle { jobs: Vec<String> },
}

/// Errors that can occur while scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("sequencing error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("state store error: {0}")]
    State(#[from] hoist_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
