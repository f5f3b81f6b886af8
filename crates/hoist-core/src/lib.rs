//! hoist-core — shared types and declarations for the hoist orchestrator.
//!
//! Everything in here is synchronous and free of I/O beyond reading the
//! declaration files. The stateful and remote parts of the system live in
//! `hoist-state`, `hoist-scheduler`, `hoist-health` and `hoist-rollout`,
//! which all speak the types defined here.

pub mod config;
pub mod manifest;
pub mod remote;
pub mod types;
pub mod validate;

pub use config::{HealthSettings, Settings, SshSettings, parse_duration};
pub use manifest::{DeclaredJob, ManifestError, Project};
pub use remote::{
    CommandOutput, ExecError, ExecFuture, RemoteExecutor, SyncFilter, job_command, job_dir,
};
pub use types::*;
pub use validate::{SERVICE_SCRIPT, ValidationError, ValidationErrors, validate_project};
