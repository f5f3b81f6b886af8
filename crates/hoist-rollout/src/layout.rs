//! On-disk layout of the state directory.
//!
//! ```text
//! <state_dir>/
//!   state.redb                 store
//!   ca/                        local certificate authority
//!   artifacts/<job>/           job trees captured at build time
//!   work/<ip>/                 rendered tree mirrored to the worker
//!     worker.json
//!     allocations.json
//!     agent/hoist-agent.sh
//!     jobs/<job>/...
//! ```

use std::path::{Path, PathBuf};

use hoist_core::manifest::JOBS_DIR;

pub const DB_FILE: &str = "state.redb";
pub const AGENT_SCRIPT: &str = "hoist-agent.sh";

/// Paths under one state directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.root.join("ca")
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn artifact_dir(&self, job: &str) -> PathBuf {
        self.artifact_root().join(job)
    }

    pub fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn work_dir(&self, worker: &str) -> PathBuf {
        self.work_root().join(worker)
    }

    pub fn job_dir(&self, worker: &str, job: &str) -> PathBuf {
        self.work_dir(worker).join(JOBS_DIR).join(job)
    }
}

/// Remote path of the agent script.
pub fn remote_agent(remote_root: &str) -> String {
    format!("{}/agent/{AGENT_SCRIPT}", remote_root.trim_end_matches('/'))
}

/// Remote command driving the agent for one job.
pub fn agent_command(remote_root: &str, action: &str, job: &str) -> String {
    format!("sh {} {action} {job}", remote_agent(remote_root))
}
