//! Deployment sequencer.
//!
//! Jobs form a graph through the `depends_on` edges of their commands. A
//! job without dependencies sits at level 0; any other job sits one level
//! above its highest dependency. Levels come from a Kahn topological sort,
//! so cycles are detected and reported instead of looping.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hoist_core::Job;
use tracing::debug;

use crate::error::SequenceError;

/// Deployment level per job name.
pub type Levels = BTreeMap<String, u32>;

/// Compute the deployment level of every job.
pub fn compute_levels(jobs: &[Job]) -> Result<Levels, SequenceError> {
    let names: BTreeSet<&str> = jobs.iter().map(|job| job.name.as_str()).collect();

    // dependency → dependents, and remaining in-degree per job.
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut deps_of: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for job in jobs {
        let deps = job.dependency_jobs();
        for dep in &deps {
            if *dep == job.name {
                return Err(SequenceError::SelfDependency(job.name.clone()));
            }
            if !names.contains(dep) {
                return Err(SequenceError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dep.to_string(),
                });
            }
            dependents.entry(*dep).or_default().push(job.name.as_str());
        }
        in_degree.insert(job.name.as_str(), deps.len());
        deps_of.insert(job.name.as_str(), deps);
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut levels = Levels::new();

    while let Some(name) = ready.pop_front() {
        let level = deps_of[name]
            .iter()
            .map(|dep| levels[*dep] + 1)
            .max()
            .unwrap_or(0);
        levels.insert(name.to_string(), level);

        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if levels.len() != in_degree.len() {
        let jobs = in_degree
            .keys()
            .filter(|name| !levels.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        return Err(SequenceError::Cycle { jobs });
    }

    debug!(
        jobs = levels.len(),
        max_level = levels.values().max().copied().unwrap_or(0),
        "levels computed"
    );
    Ok(levels)
}

/// Group job names by level, lowest level first.
pub fn jobs_by_level(levels: &Levels) -> BTreeMap<u32, Vec<String>> {
    let mut grouped: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (job, level) in levels {
        grouped.entry(*level).or_default().push(job.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoist_core::{CommandEvent, CommandRef, JobCommand};

    fn job(name: &str, deps: &[&str]) -> Job {
        let mut job = Job::new(name);
        for (i, dep) in deps.iter().enumerate() {
            job.commands.insert(
                format!("wait{i}"),
                JobCommand {
                    run: "true".to_string(),
                    on: BTreeSet::from([CommandEvent::PreDeploy]),
                    depends_on: Some(CommandRef {
                        job: dep.to_string(),
                        command: "ready".to_string(),
                    }),
                },
            );
        }
        job
    }

    #[test]
    fn independent_jobs_are_level_zero() {
        let levels = compute_levels(&[job("a", &[]), job("b", &[])]).unwrap();
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 0);
    }

    #[test]
    fn dependent_job_is_one_level_up() {
        let levels = compute_levels(&[job("b", &["a"]), job("a", &[])]).unwrap();
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 1);
    }

    #[test]
    fn level_follows_highest_dependency() {
        // d → c → a, d → b → a, d → a
        let jobs = [
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["b"]),
            job("d", &["a", "c"]),
        ];
        let levels = compute_levels(&jobs).unwrap();
        assert_eq!(levels["c"], 2);
        assert_eq!(levels["d"], 3);

        for job in &jobs {
            for dep in job.dependency_jobs() {
                assert!(levels[&job.name] > levels[dep]);
            }
        }
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let jobs = [job("a", &["c"]), job("b", &["a"]), job("c", &["b"]), job("d", &[])];
        let err = compute_levels(&jobs).unwrap_err();
        assert_eq!(
            err,
            SequenceError::Cycle {
                jobs: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = compute_levels(&[job("a", &["a"])]).unwrap_err();
        assert_eq!(err, SequenceError::SelfDependency("a".into()));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = compute_levels(&[job("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, SequenceError::UnknownDependency { .. }));
    }

    #[test]
    fn grouping_by_level() {
        let levels = compute_levels(&[job("a", &[]), job("b", &["a"]), job("c", &[])]).unwrap();
        let grouped = jobs_by_level(&levels);
        assert_eq!(grouped[&0], vec!["a", "c"]);
        assert_eq!(grouped[&1], vec!["b"]);
    }
}
