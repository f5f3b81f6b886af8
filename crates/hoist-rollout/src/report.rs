//! Results reported by the orchestrator.

use std::fmt;

use hoist_core::Allocation;
use hoist_scheduler::ScheduleSummary;
use serde::Serialize;

/// Outcome of a build.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub workers: usize,
    pub jobs: usize,
    /// Highest deployment level among the declared jobs.
    pub max_level: u32,
    pub schedule: ScheduleSummary,
}

/// Deploy phase a per-unit failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stop,
    PreDeploy,
    Sync,
    Start,
    Restart,
    Health,
    PostDeploy,
    FinalSync,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Stop => "stop",
            Phase::PreDeploy => "pre-deploy",
            Phase::Sync => "sync",
            Phase::Start => "start",
            Phase::Restart => "restart",
            Phase::Health => "health",
            Phase::PostDeploy => "post-deploy",
            Phase::FinalSync => "final sync",
        };
        f.write_str(name)
    }
}

/// A failure that was logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub phase: Phase,
    /// Empty for failures not tied to a job (final sync).
    pub job: String,
    pub worker: Option<String>,
    pub error: String,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if !self.job.is_empty() {
            write!(f, " {}", self.job)?;
        }
        if let Some(worker) = &self.worker {
            write!(f, "@{worker}")?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Outcome of a deploy run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    /// Update sequence assigned to this run.
    pub sequence: u64,
    /// Levels that had at least one job to process.
    pub levels: Vec<u32>,
    pub stopped: usize,
    pub started: usize,
    pub restarted: usize,
    /// Updated allocations skipped after a failed rolling-update gate.
    pub halted: usize,
    pub promoted: usize,
    pub failures: Vec<UnitFailure>,
}

impl DeployReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn fail(
        &mut self,
        phase: Phase,
        job: &str,
        worker: Option<&str>,
        error: impl fmt::Display,
    ) {
        self.failures.push(UnitFailure {
            phase,
            job: job.to_string(),
            worker: worker.map(str::to_string),
            error: error.to_string(),
        });
    }
}

/// Ledger view of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// Never hashed.
    Unknown,
    /// Hashed but never applied.
    New,
    /// Applied, with a newer hash pending.
    Changed,
    /// The applied hash is current.
    Applied,
}

/// One row of `hoist status`.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationStatus {
    pub allocation: Allocation,
    pub ledger: LedgerState,
}
