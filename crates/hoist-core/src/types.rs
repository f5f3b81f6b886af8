//! Domain types shared across hoist crates.
//!
//! These are the persisted shapes of workers, jobs and allocations. They
//! are produced by the manifest loader, stored JSON-encoded by
//! `hoist-state`, and consumed by the scheduler and the rollout engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label every worker carries implicitly.
pub const WORKER_LABEL: &str = "worker";

/// A worker is identified by its IP address.
pub type WorkerIp = String;

/// A job is identified by its name.
pub type JobName = String;

// ── Worker ────────────────────────────────────────────────────────

/// A remote host that can receive allocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub ip: WorkerIp,
    /// Available memory in MB.
    pub memory_mb: u64,
    /// Available CPU in MHz.
    pub cpu_mhz: u64,
    /// Stable declaration index, used for label-relative addressing.
    pub ordinal: u32,
    /// Labels, always including [`WORKER_LABEL`].
    pub labels: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
}

impl Worker {
    pub fn new(ip: &str, ordinal: u32) -> Self {
        Self {
            ip: ip.to_string(),
            memory_mb: 0,
            cpu_mhz: 0,
            ordinal,
            labels: BTreeSet::from([WORKER_LABEL.to_string()]),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle events a job command can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandEvent {
    PostBuild,
    PreDeploy,
    PostDeploy,
    HealthCheck,
    Direct,
}

impl CommandEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandEvent::PostBuild => "post_build",
            CommandEvent::PreDeploy => "pre_deploy",
            CommandEvent::PostDeploy => "post_deploy",
            CommandEvent::HealthCheck => "health_check",
            CommandEvent::Direct => "direct",
        }
    }
}

/// Reference to another job's named command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommandRef {
    pub job: JobName,
    pub command: String,
}

/// A named shell command declared by a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCommand {
    /// Shell snippet, run with `sh -c`.
    pub run: String,
    pub on: BTreeSet<CommandEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<CommandRef>,
}

impl JobCommand {
    pub fn runs_on(&self, event: CommandEvent) -> bool {
        self.on.contains(&event)
    }
}

/// Inclusive min/max resource bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceRange {
    pub min: u64,
    pub max: u64,
}

/// A declared workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub name: JobName,
    pub version: String,
    /// Memory bounds in MB.
    pub memory: ResourceRange,
    /// CPU bounds in MHz.
    pub cpu: ResourceRange,
    /// Labels a worker must carry to receive this job.
    pub selectors: BTreeSet<String>,
    /// Rolling batch size for updated allocations.
    pub update_parallel_count: u32,
    pub commands: BTreeMap<String, JobCommand>,
    pub ports: BTreeMap<String, u16>,
    /// Whether each allocation gets an issued certificate pair.
    pub certificate: bool,
}

impl Job {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "0.0.0".to_string(),
            memory: ResourceRange::default(),
            cpu: ResourceRange::default(),
            selectors: BTreeSet::new(),
            update_parallel_count: 1,
            commands: BTreeMap::new(),
            ports: BTreeMap::new(),
            certificate: false,
        }
    }

    /// Commands attached to `event`, in name order.
    pub fn commands_for(&self, event: CommandEvent) -> impl Iterator<Item = (&str, &JobCommand)> {
        self.commands
            .iter()
            .filter(move |(_, cmd)| cmd.runs_on(event))
            .map(|(name, cmd)| (name.as_str(), cmd))
    }

    /// Distinct jobs this job depends on through its commands.
    pub fn dependency_jobs(&self) -> BTreeSet<&str> {
        self.commands
            .values()
            .filter_map(|cmd| cmd.depends_on.as_ref())
            .map(|dep| dep.job.as_str())
            .collect()
    }

    /// Selector match rule: the number of the worker's labels that belong to
    /// the selector set must equal the size of the selector set. An empty
    /// selector set therefore matches every worker.
    pub fn matches(&self, worker: &Worker) -> bool {
        let hits = worker
            .labels
            .iter()
            .filter(|label| self.selectors.contains(*label))
            .count();
        hits == self.selectors.len()
    }

    /// Ledger namespace guarding this job's allocations.
    pub fn ledger_namespace(&self) -> String {
        ledger_namespace(&self.name)
    }
}

/// Ledger namespace for a job's allocations, usable after the job itself
/// has been deleted.
pub fn ledger_namespace(job: &str) -> String {
    format!("{job}_allocation")
}

// ── Allocation ────────────────────────────────────────────────────

/// Deterministic allocation id: hex SHA-256 of `job|workerIP`.
pub fn alloc_id(job: &str, worker_ip: &str) -> String {
    let digest = Sha256::digest(format!("{job}|{worker_ip}").as_bytes());
    hex::encode(digest)
}

/// Binding of one job to one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub job: JobName,
    pub worker: WorkerIp,
    pub disabled: bool,
    pub removed: bool,
    /// Deployment sequence level copied from the job.
    pub level: u32,
}

impl Allocation {
    pub fn new(job: &str, worker_ip: &str) -> Self {
        Self {
            id: alloc_id(job, worker_ip),
            job: job.to_string(),
            worker: worker_ip.to_string(),
            disabled: false,
            removed: false,
            level: 0,
        }
    }

    /// Allocations that should be running after a deploy.
    pub fn is_active(&self) -> bool {
        !self.removed && !self.disabled
    }
}

// ── Disable overrides ─────────────────────────────────────────────

/// Operator overrides that disable allocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisableOverrides {
    /// Disable every allocation on these workers.
    pub workers: BTreeSet<WorkerIp>,
    /// Disable every allocation of these jobs.
    pub jobs: BTreeSet<JobName>,
    /// Disable specific job/worker pairs.
    pub allocations: BTreeSet<AllocationRef>,
}

/// A specific job/worker pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllocationRef {
    pub job: JobName,
    pub worker: WorkerIp,
}

impl DisableOverrides {
    pub fn disables(&self, job: &str, worker_ip: &str) -> bool {
        self.workers.contains(worker_ip)
            || self.jobs.contains(job)
            || self.allocations.contains(&AllocationRef {
                job: job.to_string(),
                worker: worker_ip.to_string(),
            })
    }
}
