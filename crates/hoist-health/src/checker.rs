//! Health probes.
//!
//! The default verifier runs every `health_check` command a job declares
//! on each of its workers. A job without health-check commands is healthy
//! by definition.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hoist_core::{CommandEvent, Job, RemoteExecutor, job_command};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::debug;

/// Boxed future returned by [`HealthVerifier::check`].
pub type HealthFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HealthError>> + Send + 'a>>;

/// Health verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("job {job}: {} of {total} probe(s) failed: {}", .failures.len(), .failures.join("; "))]
    Unhealthy {
        job: String,
        total: usize,
        failures: Vec<String>,
    },

    #[error("job {job}: still unhealthy after {attempts} attempt(s): {last}")]
    GaveUp {
        job: String,
        attempts: u32,
        last: Box<HealthError>,
    },
}

/// Single-attempt health check of a job on a set of workers.
pub trait HealthVerifier: Send + Sync {
    fn check<'a>(&'a self, job: &'a Job, hosts: &'a [String]) -> HealthFuture<'a>;
}

/// Runs a job's `health_check` commands on its workers, inside the job's
/// directory under `remote_root`.
pub struct CommandHealthCheck {
    executor: Arc<dyn RemoteExecutor>,
    remote_root: String,
}

impl CommandHealthCheck {
    pub fn new(executor: Arc<dyn RemoteExecutor>, remote_root: &str) -> Self {
        Self {
            executor,
            remote_root: remote_root.to_string(),
        }
    }
}

impl HealthVerifier for CommandHealthCheck {
    fn check<'a>(&'a self, job: &'a Job, hosts: &'a [String]) -> HealthFuture<'a> {
        Box::pin(async move {
            let probes: Vec<(String, String)> = job
                .commands_for(CommandEvent::HealthCheck)
                .map(|(name, cmd)| {
                    let line = job_command(&self.remote_root, &job.name, &cmd.run);
                    (name.to_string(), line)
                })
                .collect();
            if probes.is_empty() || hosts.is_empty() {
                return Ok(());
            }

            let mut set = JoinSet::new();
            for host in hosts {
                for (name, run) in &probes {
                    let executor = Arc::clone(&self.executor);
                    let host = host.clone();
                    let name = name.clone();
                    let run = run.clone();
                    set.spawn(async move {
                        let result = executor.execute_command(&host, &run).await;
                        (host, name, result)
                    });
                }
            }

            let total = set.len();
            let mut failures = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, _, Ok(_))) => {}
                    Ok((host, name, Err(e))) => {
                        debug!(
                            job = %job.name,
                            worker = %host,
                            probe = %name,
                            error = %e,
                            "probe failed"
                        );
                        failures.push(format!("{name}@{host}: {e}"));
                    }
                    Err(e) => failures.push(format!("probe task: {e}")),
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                failures.sort();
                Err(HealthError::Unhealthy {
                    job: job.name.clone(),
                    total,
                    failures,
                })
            }
        })
    }
}
