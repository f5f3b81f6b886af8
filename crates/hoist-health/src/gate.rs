//! Retry policy around a [`HealthVerifier`].

use std::sync::Arc;
use std::time::Duration;

use hoist_core::{HealthSettings, Job};
use tracing::{debug, info, warn};

use crate::checker::{HealthError, HealthVerifier};

/// Gate used between rollout batches.
///
/// In wait mode the verifier is retried up to `attempts` times with a
/// fixed `delay` in between; otherwise a single attempt decides.
#[derive(Clone)]
pub struct HealthGate {
    verifier: Arc<dyn HealthVerifier>,
    attempts: u32,
    delay: Duration,
}

impl HealthGate {
    pub fn new(verifier: Arc<dyn HealthVerifier>, attempts: u32, delay: Duration) -> Self {
        Self {
            verifier,
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_settings(verifier: Arc<dyn HealthVerifier>, settings: &HealthSettings) -> Self {
        Self::new(verifier, settings.attempts, settings.delay())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check `job` on `hosts`, retrying when `wait` is set.
    pub async fn verify(&self, job: &Job, hosts: &[String], wait: bool) -> Result<(), HealthError> {
        let attempts = if wait { self.attempts } else { 1 };
        let mut attempt = 1;
        loop {
            match self.verifier.check(job, hosts).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(job = %job.name, attempt, "job healthy after retry");
                    } else {
                        debug!(job = %job.name, "job healthy");
                    }
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    warn!(job = %job.name, attempts, error = %e, "health check failed");
                    if attempts == 1 {
                        return Err(e);
                    }
                    return Err(HealthError::GaveUp {
                        job: job.name.clone(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!(job = %job.name, attempt, error = %e, "health check not passing yet");
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::checker::HealthFuture;

    /// Fails the first `failures` checks, then passes.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    impl HealthVerifier for Flaky {
        fn check<'a>(&'a self, job: &'a Job, _hosts: &'a [String]) -> HealthFuture<'a> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err(HealthError::Unhealthy {
                        job: job.name.clone(),
                        total: 1,
                        failures: vec!["not yet".to_string()],
                    })
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn wait_retries_until_healthy() {
        let flaky = Flaky::new(2);
        let gate = HealthGate::new(flaky.clone(), 5, Duration::ZERO);
        gate.verify(&Job::new("web"), &[], true).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_wait_is_single_attempt() {
        let flaky = Flaky::new(1);
        let gate = HealthGate::new(flaky.clone(), 5, Duration::ZERO);
        let err = gate.verify(&Job::new("web"), &[], false).await.unwrap_err();
        assert!(matches!(err, HealthError::Unhealthy { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_gives_up_after_attempts() {
        let flaky = Flaky::new(u32::MAX);
        let gate = HealthGate::new(flaky.clone(), 3, Duration::ZERO);
        let err = gate.verify(&Job::new("web"), &[], true).await.unwrap_err();
        assert!(matches!(err, HealthError::GaveUp { attempts: 3, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn settings_drive_the_policy() {
        let settings = HealthSettings {
            attempts: 0,
            delay: "1s".to_string(),
        };
        let gate = HealthGate::from_settings(Flaky::new(0), &settings);
        assert_eq!(gate.attempts(), 1);
    }
}
