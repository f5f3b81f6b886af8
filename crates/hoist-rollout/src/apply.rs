//! Apply phase for one job.
//!
//! New allocations start as a single batch followed by a health check whose
//! failure is only reported. Updated allocations restart in rolling chunks
//! of `update_parallel_count`, each chunk gated on a health check; a failed
//! gate halts the remaining chunks, which stay unpromoted and are retried
//! by the next deploy.

use std::collections::BTreeSet;
use std::sync::Arc;

use hoist_core::{Allocation, Job, RemoteExecutor};
use hoist_health::HealthGate;
use tracing::{debug, info, warn};

use crate::fanout::{RemoteCall, fan_out};
use crate::layout::agent_command;
use crate::report::{Phase, UnitFailure};

/// Allocations of one job that need work, classified after hash-update.
#[derive(Debug, Clone)]
pub(crate) struct JobApply {
    pub job: Job,
    pub new: Vec<Allocation>,
    pub updated: Vec<Allocation>,
}

impl JobApply {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty()
    }

    /// Ids of every allocation this plan touches.
    pub fn attempted(&self) -> impl Iterator<Item = &str> {
        self.new.iter().chain(&self.updated).map(|a| a.id.as_str())
    }
}

/// What happened while applying one job.
#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    pub job: String,
    /// Allocations whose start/restart succeeded.
    pub applied: BTreeSet<String>,
    pub started: usize,
    pub restarted: usize,
    /// Updated allocations left untouched after a failed gate.
    pub halted: usize,
    pub failures: Vec<UnitFailure>,
}

impl ApplyOutcome {
    fn fail(&mut self, phase: Phase, worker: Option<&str>, error: impl ToString) {
        self.failures.push(UnitFailure {
            phase,
            job: self.job.clone(),
            worker: worker.map(str::to_string),
            error: error.to_string(),
        });
    }
}

pub(crate) async fn apply_job(
    executor: Arc<dyn RemoteExecutor>,
    gate: HealthGate,
    remote_root: String,
    plan: JobApply,
) -> ApplyOutcome {
    let job = &plan.job;
    let mut outcome = ApplyOutcome {
        job: job.name.clone(),
        ..Default::default()
    };

    if !plan.new.is_empty() {
        let limit = plan.new.len();
        info!(job = %job.name, batch = limit, "starting new allocations");
        let hosts = run_batch(
            &executor,
            &remote_root,
            job,
            "start",
            &plan.new,
            limit,
            &mut outcome,
        )
        .await;
        outcome.started = hosts.len();
        if !hosts.is_empty() {
            if let Err(e) = gate.verify(job, &hosts, true).await {
                warn!(job = %job.name, error = %e, "new allocations unhealthy");
                outcome.fail(Phase::Health, None, e);
            }
        }
    }

    let chunk_size = job.update_parallel_count.max(1) as usize;
    let total_chunks = plan.updated.len().div_ceil(chunk_size);
    for (index, chunk) in plan.updated.chunks(chunk_size).enumerate() {
        debug!(job = %job.name, chunk = index + 1, total = total_chunks, "rolling update chunk");
        let hosts = run_batch(
            &executor,
            &remote_root,
            job,
            "restart",
            chunk,
            chunk.len(),
            &mut outcome,
        )
        .await;
        outcome.restarted += hosts.len();

        if hosts.is_empty() {
            continue;
        }
        if let Err(e) = gate.verify(job, &hosts, true).await {
            let remaining = plan.updated.len().saturating_sub((index + 1) * chunk_size);
            warn!(
                job = %job.name,
                chunk = index + 1,
                halted = remaining,
                error = %e,
                "health gate failed, halting rolling update"
            );
            outcome.fail(Phase::Health, None, e);
            outcome.halted = remaining;
            break;
        }
    }

    outcome
}

/// Run `action` for `allocs` and return the hosts that succeeded.
async fn run_batch(
    executor: &Arc<dyn RemoteExecutor>,
    remote_root: &str,
    job: &Job,
    action: &str,
    allocs: &[Allocation],
    limit: usize,
    outcome: &mut ApplyOutcome,
) -> Vec<String> {
    let command = agent_command(remote_root, action, &job.name);
    let calls = allocs
        .iter()
        .map(|alloc| {
            (
                alloc.id.clone(),
                alloc.worker.clone(),
                RemoteCall::Command(command.clone()),
            )
        })
        .collect();

    let phase = if action == "start" {
        Phase::Start
    } else {
        Phase::Restart
    };

    let mut hosts = Vec::new();
    for call in fan_out(executor, calls, limit).await {
        match call.result {
            Ok(_) => {
                debug!(job = %job.name, worker = %call.host, %action, "allocation applied");
                outcome.applied.insert(call.key);
                hosts.push(call.host);
            }
            Err(e) => {
                warn!(
                    job = %job.name,
                    worker = %call.host,
                    %action,
                    error = %e,
                    "allocation failed"
                );
                outcome.fail(phase, Some(&call.host), e);
            }
        }
    }
    hosts
}
