//! hoist-rollout — staged, ledger-guarded rollouts over SSH.
//!
//! The [`Orchestrator`] owns the state store and drives a
//! [`RemoteExecutor`](hoist_core::RemoteExecutor) through build and deploy:
//!
//! ```text
//! build:  validate → levels → post_build hooks → artifacts → schedule
//! deploy: for each level
//!           stop → prepare → pre_deploy → sync → hash-update
//!           → apply (start / rolling restart + health gate)
//!           → post_deploy → promote
//!         final pass (unscoped sync of every worker tree)
//! ```
//!
//! Local trees live under the state directory (see [`Layout`]); the
//! [`SshExecutor`] mirrors them to workers with rsync and runs commands
//! with ssh. Every remote call goes through a [`BoundedExecutor`] so at
//! most `max_in_flight` operations run at once.

mod apply;
pub mod certs;
pub mod error;
mod fanout;
pub mod layout;
pub mod orchestrator;
pub mod pool;
pub mod prepare;
pub mod render;
pub mod report;
pub mod ssh;

pub use certs::{CertError, CertificateIssuer, IssuedCert, LocalCa};
pub use error::{RolloutError, RolloutResult};
pub use layout::Layout;
pub use orchestrator::Orchestrator;
pub use pool::BoundedExecutor;
pub use render::{RenderContext, RenderError};
pub use report::{
    AllocationStatus, BuildSummary, DeployReport, LedgerState, Phase, UnitFailure,
};
pub use ssh::SshExecutor;
