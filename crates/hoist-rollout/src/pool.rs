//! Global bound on in-flight remote operations.
//!
//! Every phase fans out per worker or per job. The fan-out is kept, but
//! every remote call goes through one shared semaphore so the total number
//! of concurrent ssh/rsync processes never exceeds `max_in_flight`.

use std::path::Path;
use std::sync::Arc;

use hoist_core::{ExecError, ExecFuture, RemoteExecutor, SyncFilter};
use tokio::sync::Semaphore;
use tracing::trace;

/// A [`RemoteExecutor`] that admits at most `limit` calls at a time.
pub struct BoundedExecutor {
    inner: Arc<dyn RemoteExecutor>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BoundedExecutor {
    pub fn new(inner: Arc<dyn RemoteExecutor>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    fn bounded<'a>(&'a self, host: &'a str, call: ExecFuture<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            let _permit = self.permits.acquire().await.map_err(|_| ExecError::Closed)?;
            trace!(%host, in_flight = self.in_flight(), "remote call admitted");
            call.await
        })
    }
}

impl RemoteExecutor for BoundedExecutor {
    fn execute_command<'a>(&'a self, host: &'a str, command: &'a str) -> ExecFuture<'a> {
        self.bounded(host, self.inner.execute_command(host, command))
    }

    fn execute_file_command<'a>(&'a self, host: &'a str, script: &'a Path) -> ExecFuture<'a> {
        self.bounded(host, self.inner.execute_file_command(host, script))
    }

    fn sync_directory<'a>(
        &'a self,
        host: &'a str,
        local_dir: &'a Path,
        remote_dir: &'a str,
        filter: &'a SyncFilter,
    ) -> ExecFuture<'a> {
        self.bounded(
            host,
            self.inner.sync_directory(host, local_dir, remote_dir, filter),
        )
    }

    fn run_local<'a>(
        &'a self,
        dir: &'a Path,
        command: &'a str,
        env: &'a [(String, String)],
    ) -> ExecFuture<'a> {
        self.bounded("localhost", self.inner.run_local(dir, command, env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use hoist_core::CommandOutput;
    use tokio::task::JoinSet;

    /// Tracks the highest number of overlapping calls.
    #[derive(Default)]
    struct Slow {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Slow {
        fn call(&self) -> ExecFuture<'_> {
            Box::pin(async move {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(CommandOutput::default())
            })
        }
    }

    impl RemoteExecutor for Slow {
        fn execute_command<'a>(&'a self, _host: &'a str, _command: &'a str) -> ExecFuture<'a> {
            self.call()
        }

        fn execute_file_command<'a>(&'a self, _host: &'a str, _script: &'a Path) -> ExecFuture<'a> {
            self.call()
        }

        fn sync_directory<'a>(
            &'a self,
            _host: &'a str,
            _local_dir: &'a Path,
            _remote_dir: &'a str,
            _filter: &'a SyncFilter,
        ) -> ExecFuture<'a> {
            self.call()
        }

        fn run_local<'a>(
            &'a self,
            _dir: &'a Path,
            _command: &'a str,
            _env: &'a [(String, String)],
        ) -> ExecFuture<'a> {
            self.call()
        }
    }

    #[tokio::test]
    async fn caps_concurrent_calls() {
        let slow = Arc::new(Slow::default());
        let bounded = Arc::new(BoundedExecutor::new(slow.clone(), 3));

        let mut set = JoinSet::new();
        for i in 0..12 {
            let bounded = Arc::clone(&bounded);
            set.spawn(async move {
                let host = format!("10.0.0.{i}");
                bounded.execute_command(&host, "true").await
            });
        }
        while let Some(result) = set.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(slow.peak.load(Ordering::SeqCst), 3);
        assert_eq!(bounded.in_flight(), 0);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        let bounded = BoundedExecutor::new(Arc::new(Slow::default()), 0);
        assert_eq!(bounded.limit(), 1);
    }
}
