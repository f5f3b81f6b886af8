//! hoist-health — health verification for rollouts.
//!
//! A [`HealthVerifier`] answers one question with a single attempt: is this
//! job healthy on these workers right now? The [`HealthGate`] wraps a
//! verifier with the retry policy the rollout engine uses between batches.
//!
//! # Architecture
//!
//! ```text
//! HealthGate (attempts × delay when waiting, one attempt otherwise)
//!   └── dyn HealthVerifier
//!         └── CommandHealthCheck
//!               └── dyn RemoteExecutor (runs the job's health_check
//!                                        commands on every worker)
//! ```

pub mod checker;
pub mod gate;

pub use checker::{CommandHealthCheck, HealthError, HealthFuture, HealthVerifier};
pub use gate::HealthGate;
