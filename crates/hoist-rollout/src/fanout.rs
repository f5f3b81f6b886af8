//! Concurrent dispatch of remote calls.

use std::path::PathBuf;
use std::sync::Arc;

use hoist_core::{CommandOutput, ExecError, RemoteExecutor, SyncFilter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// One remote operation against one host.
#[derive(Debug, Clone)]
pub(crate) enum RemoteCall {
    Command(String),
    Script(PathBuf),
    Sync {
        local: PathBuf,
        remote: String,
        filter: SyncFilter,
    },
}

/// Result of one call, tagged with the caller's key and the host.
pub(crate) struct CallResult<K> {
    pub key: K,
    pub host: String,
    pub result: Result<CommandOutput, ExecError>,
}

/// Run `calls` concurrently, at most `limit` at a time, and return every
/// result ordered by host. The executor applies its own global bound on
/// top of `limit`.
pub(crate) async fn fan_out<K>(
    executor: &Arc<dyn RemoteExecutor>,
    calls: Vec<(K, String, RemoteCall)>,
    limit: usize,
) -> Vec<CallResult<K>>
where
    K: Send + 'static,
{
    let batch = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    for (key, host, call) in calls {
        let executor = Arc::clone(executor);
        let batch = Arc::clone(&batch);
        set.spawn(async move {
            let result = match batch.acquire_owned().await {
                Ok(_permit) => dispatch(executor.as_ref(), &host, &call).await,
                Err(_) => Err(ExecError::Closed),
            };
            CallResult { key, host, result }
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        // Propagate panics from executor tasks.
        match joined {
            Ok(result) => results.push(result),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
    }
    results.sort_by(|a, b| a.host.cmp(&b.host));
    results
}

async fn dispatch(
    executor: &dyn RemoteExecutor,
    host: &str,
    call: &RemoteCall,
) -> Result<CommandOutput, ExecError> {
    match call {
        RemoteCall::Command(command) => executor.execute_command(host, command).await,
        RemoteCall::Script(path) => executor.execute_file_command(host, path).await,
        RemoteCall::Sync {
            local,
            remote,
            filter,
        } => executor.sync_directory(host, local, remote, filter).await,
    }
}
