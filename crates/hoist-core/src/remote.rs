//! Remote execution contract.
//!
//! The rollout engine never talks to a transport directly. It drives an
//! implementation of [`RemoteExecutor`], which is injected for testability;
//! `hoist-rollout` ships an SSH/rsync implementation. Every call is
//! independent: implementations apply their own timeouts and never retry.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

/// Boxed future returned by every executor call.
pub type ExecFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Captured output of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Errors from a single executor call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("{host}: exited with status {code:?}: {stderr}")]
    Failed {
        host: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{host}: timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("{host}: failed to spawn {program}: {reason}")]
    Spawn {
        host: String,
        program: String,
        reason: String,
    },

    #[error("executor is shut down")]
    Closed,
}

/// Include/exclude rules for a directory sync.
///
/// `jobs == None` syncs the whole tree. `Some(set)` restricts the `jobs/`
/// subtree to the named job directories; other job directories on the
/// remote side are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncFilter {
    pub jobs: Option<BTreeSet<String>>,
}

impl SyncFilter {
    pub fn all() -> Self {
        Self { jobs: None }
    }

    pub fn only<I, S>(jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jobs: Some(jobs.into_iter().map(Into::into).collect()),
        }
    }

    pub fn allows(&self, job: &str) -> bool {
        self.jobs.as_ref().is_none_or(|jobs| jobs.contains(job))
    }

    /// rsync-style filter rules, first match wins.
    pub fn rules(&self) -> Vec<String> {
        let Some(jobs) = &self.jobs else {
            return Vec::new();
        };
        let mut rules = vec!["+ /jobs/".to_string()];
        rules.extend(jobs.iter().map(|job| format!("+ /jobs/{job}/***")));
        rules.push("- /jobs/*".to_string());
        rules
    }
}

/// Directory of `job` under a worker's remote root.
pub fn job_dir(remote_root: &str, job: &str) -> String {
    format!("{}/jobs/{job}", remote_root.trim_end_matches('/'))
}

/// Shell line running `command` inside the job's directory with its
/// environment module sourced.
pub fn job_command(remote_root: &str, job: &str, command: &str) -> String {
    format!("cd {} && . ./.hoist/env.sh && {command}", job_dir(remote_root, job))
}

/// Transport used by the rollout engine.
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on `host`.
    fn execute_command<'a>(&'a self, host: &'a str, command: &'a str) -> ExecFuture<'a>;

    /// Run a local script file on `host`.
    fn execute_file_command<'a>(&'a self, host: &'a str, script: &'a Path) -> ExecFuture<'a>;

    /// Mirror `local_dir` into `remote_dir` on `host`, deleting extraneous
    /// files that the filter does not protect.
    fn sync_directory<'a>(
        &'a self,
        host: &'a str,
        local_dir: &'a Path,
        remote_dir: &'a str,
        filter: &'a SyncFilter,
    ) -> ExecFuture<'a>;

    /// Run a shell command on the orchestrator host, in `dir`.
    fn run_local<'a>(
        &'a self,
        dir: &'a Path,
        command: &'a str,
        env: &'a [(String, String)],
    ) -> ExecFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_filter_has_no_rules() {
        let filter = SyncFilter::all();
        assert!(filter.rules().is_empty());
        assert!(filter.allows("anything"));
    }

    #[test]
    fn scoped_filter_protects_other_jobs() {
        let filter = SyncFilter::only(["web", "api"]);
        assert_eq!(
            filter.rules(),
            vec![
                "+ /jobs/".to_string(),
                "+ /jobs/api/***".to_string(),
                "+ /jobs/web/***".to_string(),
                "- /jobs/*".to_string(),
            ]
        );
        assert!(filter.allows("web"));
        assert!(!filter.allows("db"));
    }

    #[test]
    fn job_commands_run_in_the_job_dir() {
        assert_eq!(job_dir("/opt/hoist/", "web"), "/opt/hoist/jobs/web");
        assert_eq!(
            job_command("/opt/hoist", "web", "./check.sh"),
            "cd /opt/hoist/jobs/web && . ./.hoist/env.sh && ./check.sh"
        );
    }
}
