//! Rollout error types.
//!
//! Everything in [`RolloutError`] is fatal to the current build or deploy.
//! Per-worker failures during a deploy are not errors: they are collected
//! in the [`DeployReport`](crate::DeployReport) and retried on the next run.

use std::path::PathBuf;

use hoist_core::{ExecError, ManifestError, ValidationErrors};
use hoist_scheduler::{SchedulerError, SequenceError};
use hoist_state::StateError;
use thiserror::Error;

use crate::certs::CertError;
use crate::render::RenderError;

/// Errors that abort a build, a deploy or a bulk command.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("invalid job dependencies: {0}")]
    Sequence(#[from] SequenceError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("template error: {0}")]
    Render(#[from] RenderError),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {job} has no direct command {command:?}")]
    UnknownCommand { job: String, command: String },

    #[error("job {job}: {event} command {command:?} failed: {source}")]
    Hook {
        job: String,
        event: &'static str,
        command: String,
        #[source]
        source: ExecError,
    },

    #[error("{failed} worker(s) failed")]
    WorkersFailed { failed: usize, total: usize },
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Attach a path to an I/O error.
pub(crate) fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> RolloutError {
    let path = path.into();
    move |source| RolloutError::Io { path, source }
}
