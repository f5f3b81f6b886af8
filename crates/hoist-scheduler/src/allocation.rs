//! Allocation scheduler.
//!
//! A full projection of the declared workers and jobs onto allocation rows.
//! Every build recomputes the whole set: matched pairs are upserted under
//! their deterministic id, pairs that stopped matching (or whose worker is
//! gone) are flagged `removed`, and the `disabled` flag is recomputed from
//! the operator's overrides.

use std::collections::{BTreeMap, BTreeSet};

use hoist_core::{Allocation, DisableOverrides, Job, Worker, alloc_id};
use hoist_state::{StateRead, Txn};
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::sequencer::Levels;

/// Counts produced by one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    /// Allocations that are not removed.
    pub assigned: usize,
    /// Rows created by this pass.
    pub added: usize,
    /// Rows flagged removed by this pass.
    pub removed: usize,
    /// Non-removed allocations currently disabled.
    pub disabled: usize,
}

/// Result of [`project`]: the complete allocation set and its summary.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    /// Every allocation row, ordered by job then worker.
    pub allocations: Vec<Allocation>,
    pub summary: ScheduleSummary,
}

/// Project workers and jobs onto allocations.
///
/// `existing` is the previously stored set. Rows are never dropped: a
/// removed allocation stays until the rollout engine has stopped it.
pub fn project(
    workers: &[Worker],
    jobs: &[Job],
    existing: &[Allocation],
    disable: &DisableOverrides,
    levels: &Levels,
) -> Projection {
    let mut rows: BTreeMap<String, Allocation> = existing
        .iter()
        .map(|alloc| (alloc.id.clone(), alloc.clone()))
        .collect();
    let mut summary = ScheduleSummary::default();

    for worker in workers {
        let previous: BTreeSet<&str> = existing
            .iter()
            .filter(|alloc| alloc.worker == worker.ip && !alloc.removed)
            .map(|alloc| alloc.job.as_str())
            .collect();

        let mut matched = BTreeSet::new();
        for job in jobs.iter().filter(|job| job.matches(worker)) {
            let id = alloc_id(&job.name, &worker.ip);
            if !rows.contains_key(&id) {
                summary.added += 1;
            }
            let alloc = rows
                .entry(id)
                .or_insert_with(|| Allocation::new(&job.name, &worker.ip));
            alloc.removed = false;
            matched.insert(job.name.as_str());
        }

        for job in previous.difference(&matched) {
            if let Some(alloc) = rows.get_mut(&alloc_id(job, &worker.ip)) {
                alloc.removed = true;
                summary.removed += 1;
                debug!(%job, worker = %worker.ip, "allocation no longer matches");
            }
        }
    }

    let live_workers: BTreeSet<&str> = workers.iter().map(|w| w.ip.as_str()).collect();
    for alloc in rows.values_mut() {
        if !alloc.removed && !live_workers.contains(alloc.worker.as_str()) {
            alloc.removed = true;
            summary.removed += 1;
            debug!(job = %alloc.job, worker = %alloc.worker, "worker gone, allocation removed");
        }
        alloc.disabled = disable.disables(&alloc.job, &alloc.worker);
        if let Some(level) = levels.get(&alloc.job) {
            alloc.level = *level;
        }
        if !alloc.removed {
            summary.assigned += 1;
            if alloc.disabled {
                summary.disabled += 1;
            }
        }
    }

    let mut allocations: Vec<Allocation> = rows.into_values().collect();
    allocations.sort_by(|a, b| a.job.cmp(&b.job).then_with(|| a.worker.cmp(&b.worker)));
    Projection {
        allocations,
        summary,
    }
}

/// Replace the stored worker and job declarations.
///
/// Workers and jobs that are no longer declared are deleted; their
/// allocations survive as removed rows.
pub fn declare_cluster(txn: &mut Txn, workers: &[Worker], jobs: &[Job]) -> SchedulerResult<()> {
    let declared_workers: BTreeSet<&str> = workers.iter().map(|w| w.ip.as_str()).collect();
    for stale in txn.workers()? {
        if !declared_workers.contains(stale.ip.as_str()) {
            txn.delete_worker(&stale.ip)?;
        }
    }
    for worker in workers {
        txn.put_worker(worker)?;
    }

    let declared_jobs: BTreeSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    for stale in txn.jobs()? {
        if !declared_jobs.contains(stale.name.as_str()) {
            txn.delete_job(&stale.name)?;
        }
    }
    for job in jobs {
        txn.put_job(job)?;
    }

    debug!(workers = workers.len(), jobs = jobs.len(), "cluster declared");
    Ok(())
}

/// Run the scheduler against the stored workers and jobs and persist the
/// projected allocations.
pub fn schedule(
    txn: &mut Txn,
    disable: &DisableOverrides,
    levels: &Levels,
) -> SchedulerResult<ScheduleSummary> {
    let workers = txn.workers()?;
    let jobs = txn.jobs()?;
    let existing = txn.allocations()?;

    let projection = project(&workers, &jobs, &existing, disable, levels);

    let before: BTreeMap<&str, &Allocation> =
        existing.iter().map(|alloc| (alloc.id.as_str(), alloc)).collect();
    let mut written = 0usize;
    for alloc in &projection.allocations {
        if before.get(alloc.id.as_str()) != Some(&alloc) {
            txn.put_allocation(alloc)?;
            written += 1;
        }
    }

    let summary = projection.summary;
    info!(
        assigned = summary.assigned,
        added = summary.added,
        removed = summary.removed,
        disabled = summary.disabled,
        written,
        "allocations scheduled"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_core::AllocationRef;
    use hoist_state::StateStore;

    fn workers() -> Vec<Worker> {
        vec![
            Worker::new("10.0.0.1", 0).with_labels(["web"]),
            Worker::new("10.0.0.2", 1).with_labels(["db"]),
        ]
    }

    fn job(name: &str, selectors: &[&str]) -> Job {
        let mut job = Job::new(name);
        job.selectors = selectors.iter().map(|s| s.to_string()).collect();
        job
    }

    fn find<'a>(allocs: &'a [Allocation], job: &str, ip: &str) -> &'a Allocation {
        allocs
            .iter()
            .find(|a| a.job == job && a.worker == ip)
            .unwrap()
    }

    #[test]
    fn empty_selectors_land_everywhere() {
        let p = project(&workers(), &[job("agent", &[])], &[], &Default::default(), &Levels::new());
        assert_eq!(p.allocations.len(), 2);
        assert_eq!(p.summary.added, 2);
        assert_eq!(p.summary.assigned, 2);
        assert!(p.allocations.iter().all(|a| a.level == 0 && a.is_active()));
    }

    #[test]
    fn selectors_pick_matching_workers() {
        let jobs = [job("web", &["web"]), job("pg", &["db"]), job("none", &["gpu"])];
        let p = project(&workers(), &jobs, &[], &Default::default(), &Levels::new());
        assert_eq!(p.allocations.len(), 2);
        find(&p.allocations, "web", "10.0.0.1");
        find(&p.allocations, "pg", "10.0.0.2");
    }

    #[test]
    fn reprojection_is_stable() {
        let jobs = [job("agent", &[])];
        let first = project(&workers(), &jobs, &[], &Default::default(), &Levels::new());
        let second = project(
            &workers(),
            &jobs,
            &first.allocations,
            &Default::default(),
            &Levels::new(),
        );
        assert_eq!(first.allocations, second.allocations);
        assert_eq!(second.summary.added, 0);
        assert_eq!(second.summary.removed, 0);
    }

    #[test]
    fn removal_is_soft() {
        let jobs = [job("agent", &[]), job("web", &["web"])];
        let first = project(&workers(), &jobs, &[], &Default::default(), &Levels::new());

        // Drop the web job and the second worker.
        let second = project(
            &workers()[..1],
            &jobs[..1],
            &first.allocations,
            &Default::default(),
            &Levels::new(),
        );
        assert_eq!(second.allocations.len(), first.allocations.len());
        assert!(find(&second.allocations, "web", "10.0.0.1").removed);
        assert!(find(&second.allocations, "agent", "10.0.0.2").removed);
        assert!(!find(&second.allocations, "agent", "10.0.0.1").removed);
        assert_eq!(second.summary.removed, 2);
    }

    #[test]
    fn rematch_clears_removed() {
        let jobs = [job("agent", &[])];
        let first = project(&workers(), &jobs, &[], &Default::default(), &Levels::new());
        let gone = project(&workers(), &[], &first.allocations, &Default::default(), &Levels::new());
        assert!(gone.allocations.iter().all(|a| a.removed));

        let back = project(&workers(), &jobs, &gone.allocations, &Default::default(), &Levels::new());
        assert!(back.allocations.iter().all(|a| !a.removed));
        assert_eq!(back.summary.added, 0);
    }

    #[test]
    fn disable_follows_declaration() {
        let jobs = [job("agent", &[])];
        let disable = DisableOverrides {
            allocations: BTreeSet::from([AllocationRef {
                job: "agent".into(),
                worker: "10.0.0.2".into(),
            }]),
            ..Default::default()
        };
        let first = project(&workers(), &jobs, &[], &disable, &Levels::new());
        assert!(find(&first.allocations, "agent", "10.0.0.2").disabled);
        assert!(!find(&first.allocations, "agent", "10.0.0.1").disabled);
        assert_eq!(first.summary.disabled, 1);

        let enabled = project(&workers(), &jobs, &first.allocations, &Default::default(), &Levels::new());
        assert!(enabled.allocations.iter().all(|a| !a.disabled));
    }

    #[test]
    fn levels_are_stamped() {
        let levels = Levels::from([("agent".to_string(), 2)]);
        let p = project(&workers(), &[job("agent", &[])], &[], &Default::default(), &levels);
        assert!(p.allocations.iter().all(|a| a.level == 2));
    }

    #[test]
    fn schedule_persists_through_store() {
        let store = StateStore::open_in_memory().unwrap();
        let jobs = vec![job("agent", &[]), job("web", &["web"])];

        let summary = store
            .write(|tx| {
                declare_cluster(tx, &workers(), &jobs)?;
                schedule(tx, &Default::default(), &Levels::new())
            })
            .unwrap();
        assert_eq!(summary.assigned, 3);
        assert_eq!(store.allocations().unwrap().len(), 3);

        // Remove the db worker: its row survives, flagged removed.
        store
            .write(|tx| {
                declare_cluster(tx, &workers()[..1], &jobs)?;
                schedule(tx, &Default::default(), &Levels::new())
            })
            .unwrap();
        assert!(store.worker("10.0.0.2").unwrap().is_none());
        let allocs = store.allocations().unwrap();
        assert_eq!(allocs.len(), 3);
        assert!(find(&allocs, "agent", "10.0.0.2").removed);
    }
}
