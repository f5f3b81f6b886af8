//! Rollout orchestrator.
//!
//! `build` turns declarations into stored workers, jobs and allocations.
//! `deploy` walks the deployment levels in order; each level runs the same
//! phase sequence:
//!
//! ```text
//! stop/disable → prepare → pre-deploy hooks → sync
//!   → hash-update (commit) → apply → post-deploy hooks → promote (commit)
//! ```
//!
//! and a final pass mirrors every worker tree unscoped. Each commit is its
//! own atomic unit and phases hand their results to the next as values.
//! A run killed between the two commits leaves hash records changed but
//! unpromoted, so the next deploy reapplies them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use hoist_core::{
    Allocation, CommandEvent, CommandOutput, Job, Project, RemoteExecutor, Settings, SyncFilter,
    Worker, job_command, ledger_namespace, validate_project,
};
use hoist_health::{CommandHealthCheck, HealthGate, HealthVerifier};
use hoist_scheduler::{compute_levels, declare_cluster, schedule};
use hoist_state::{StateRead, StateStore, UPDATE_SEQUENCE};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::apply::{ApplyOutcome, JobApply, apply_job};
use crate::certs::{CertificateIssuer, LocalCa};
use crate::error::{RolloutError, RolloutResult, io_err};
use crate::fanout::{RemoteCall, fan_out};
use crate::layout::{Layout, agent_command};
use crate::pool::BoundedExecutor;
use crate::prepare::{
    hash_tree, materialize_job, remove_dir, snapshot_artifacts, write_worker_documents,
};
use crate::render::RenderContext;
use crate::report::{AllocationStatus, BuildSummary, DeployReport, LedgerState, Phase};

/// Drives builds and deploys against one state directory.
pub struct Orchestrator {
    store: StateStore,
    executor: Arc<dyn RemoteExecutor>,
    gate: HealthGate,
    issuer: Arc<dyn CertificateIssuer>,
    settings: Settings,
    layout: Layout,
}

/// Prepare-phase output for one level.
#[derive(Debug, Default)]
struct Prepared {
    /// Content hash per allocation id.
    hashes: BTreeMap<String, String>,
    /// Jobs with at least one active allocation whose content differs from
    /// what was last applied.
    changed_jobs: BTreeSet<String>,
    /// Workers holding such allocations.
    sync_workers: BTreeSet<String>,
}

/// Classification after hash-update.
#[derive(Debug, Default)]
struct Classified {
    plans: Vec<JobApply>,
    /// Changed allocations on workers whose sync failed.
    held: BTreeSet<String>,
}

impl Orchestrator {
    /// Create an orchestrator. Every remote call made through `executor` is
    /// bounded by `settings.max_in_flight`.
    pub fn new(
        store: StateStore,
        executor: Arc<dyn RemoteExecutor>,
        settings: Settings,
        state_dir: &Path,
    ) -> Self {
        let layout = Layout::new(state_dir);
        let executor: Arc<dyn RemoteExecutor> =
            Arc::new(BoundedExecutor::new(executor, settings.max_in_flight));
        let verifier = Arc::new(CommandHealthCheck::new(
            Arc::clone(&executor),
            &settings.remote_root,
        ));
        Self {
            gate: HealthGate::from_settings(verifier, &settings.health),
            issuer: Arc::new(LocalCa::new(&layout.ca_dir())),
            store,
            executor,
            settings,
            layout,
        }
    }

    /// Open the project's state directory and store.
    pub fn open(project: &Project, executor: Arc<dyn RemoteExecutor>) -> RolloutResult<Self> {
        let state_dir = project.state_dir();
        fs::create_dir_all(&state_dir).map_err(io_err(&state_dir))?;
        let store = StateStore::open(&Layout::new(&state_dir).db_path())?;
        Ok(Self::new(store, executor, project.settings.clone(), &state_dir))
    }

    /// Replace the health verifier (the retry policy is kept).
    pub fn with_health_verifier(mut self, verifier: Arc<dyn HealthVerifier>) -> Self {
        self.gate = HealthGate::from_settings(verifier, &self.settings.health);
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    // ── Build ──────────────────────────────────────────────────────

    /// Validate declarations, run post-build hooks, capture job artifacts
    /// and project allocations. Nothing is written to the store unless
    /// every step before the final transaction succeeded.
    pub async fn build(&self, project: &Project) -> RolloutResult<BuildSummary> {
        validate_project(project)?;
        let specs = project.job_specs();
        let levels = compute_levels(&specs)?;

        for declared in &project.jobs {
            self.run_hooks(&declared.job, CommandEvent::PostBuild, &declared.files_dir())
                .await?;
        }

        let declared: BTreeSet<&str> = specs.iter().map(|j| j.name.as_str()).collect();
        for declared_job in &project.jobs {
            let dst = self.layout.artifact_dir(&declared_job.job.name);
            snapshot_artifacts(&declared_job.files_dir(), &dst)?;
        }
        self.prune_artifacts(&declared)?;

        let summary = self.store.write(|tx| -> RolloutResult<_> {
            declare_cluster(tx, &project.workers, &specs)?;
            Ok(schedule(tx, &project.disable, &levels)?)
        })?;

        let build = BuildSummary {
            workers: project.workers.len(),
            jobs: specs.len(),
            max_level: levels.values().max().copied().unwrap_or(0),
            schedule: summary,
        };
        info!(
            workers = build.workers,
            jobs = build.jobs,
            max_level = build.max_level,
            "build complete"
        );
        Ok(build)
    }

    fn prune_artifacts(&self, declared: &BTreeSet<&str>) -> RolloutResult<()> {
        let root = self.layout.artifact_root();
        if !root.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&root).map_err(io_err(&root))? {
            let entry = entry.map_err(io_err(&root))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !declared.contains(name.as_str()) {
                debug!(job = %name, "pruning artifacts of undeclared job");
                remove_dir(&entry.path())?;
            }
        }
        Ok(())
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Run one staged rollout. `filter` restricts the run to the named
    /// jobs; empty means every job.
    pub async fn deploy(&self, filter: &[String]) -> RolloutResult<DeployReport> {
        let (allocations, jobs) = {
            let snapshot = self.store.snapshot()?;
            (snapshot.allocations()?, snapshot.jobs()?)
        };

        let known: BTreeSet<&str> = allocations
            .iter()
            .map(|a| a.job.as_str())
            .chain(jobs.iter().map(|j| j.name.as_str()))
            .collect();
        if let Some(unknown) = filter.iter().find(|name| !known.contains(name.as_str())) {
            return Err(RolloutError::UnknownJob(unknown.clone()));
        }
        let filter: Option<BTreeSet<&str>> =
            (!filter.is_empty()).then(|| filter.iter().map(String::as_str).collect());

        let sequence = self.store.write(|tx| tx.bump_counter(UPDATE_SEQUENCE))?;
        let mut report = DeployReport {
            sequence,
            ..Default::default()
        };
        info!(sequence, jobs = ?filter, "deploy started");

        let mut by_level: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for alloc in &allocations {
            if filter.as_ref().is_none_or(|f| f.contains(alloc.job.as_str())) {
                by_level
                    .entry(alloc.level)
                    .or_default()
                    .insert(alloc.job.clone());
            }
        }

        for (level, level_jobs) in &by_level {
            info!(level, jobs = ?level_jobs, "deploying level");
            report.levels.push(*level);
            self.deploy_level(*level, level_jobs, sequence, &mut report)
                .await?;
        }

        self.final_pass(sequence, &mut report).await?;

        info!(
            sequence,
            stopped = report.stopped,
            started = report.started,
            restarted = report.restarted,
            halted = report.halted,
            promoted = report.promoted,
            failures = report.failures.len(),
            "deploy finished"
        );
        Ok(report)
    }

    async fn deploy_level(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        sequence: u64,
        report: &mut DeployReport,
    ) -> RolloutResult<()> {
        let stop_failed = self.stop_phase(level, jobs, report).await?;
        let prepared = self.prepare_phase(level, jobs, sequence)?;

        for job in &prepared.changed_jobs {
            self.run_deploy_hooks(job, CommandEvent::PreDeploy, report)
                .await?;
        }

        let unsynced = self.sync_phase(&prepared.sync_workers, jobs, report).await;
        self.hash_update_phase(level, jobs, &prepared.hashes, &stop_failed)?;
        let classified = self.classify(level, jobs, &unsynced)?;

        let outcomes = self.apply_phase(&classified.plans, report).await;

        for outcome in &outcomes {
            if !outcome.applied.is_empty() {
                self.run_deploy_hooks(&outcome.job, CommandEvent::PostDeploy, report)
                    .await?;
            }
        }

        let attempted: BTreeSet<&str> = classified
            .plans
            .iter()
            .flat_map(JobApply::attempted)
            .collect();
        let applied: BTreeSet<&str> = outcomes
            .iter()
            .flat_map(|o| o.applied.iter().map(String::as_str))
            .collect();
        report.promoted +=
            self.promote_phase(level, jobs, &attempted, &applied, &classified.held, &stop_failed)?;
        Ok(())
    }

    /// Stop removed and disabled allocations that were running. Returns the
    /// ids whose stop failed.
    async fn stop_phase(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        report: &mut DeployReport,
    ) -> RolloutResult<BTreeSet<String>> {
        let snapshot = self.store.snapshot()?;
        let mut calls = Vec::new();
        for alloc in level_allocations(&snapshot, level, jobs)? {
            if alloc.is_active() {
                continue;
            }
            let previous = snapshot.previous_hash(&ledger_namespace(&alloc.job), &alloc.id)?;
            if previous.is_empty() {
                continue;
            }
            let command = agent_command(&self.settings.remote_root, "stop", &alloc.job);
            calls.push((alloc.clone(), alloc.worker.clone(), RemoteCall::Command(command)));
        }
        if calls.is_empty() {
            return Ok(BTreeSet::new());
        }

        let limit = calls.len();
        let mut failed = BTreeSet::new();
        let mut stopped_jobs = BTreeSet::new();
        for call in fan_out(&self.executor, calls, limit).await {
            match call.result {
                Ok(_) => {
                    info!(job = %call.key.job, worker = %call.host, "allocation stopped");
                    report.stopped += 1;
                    stopped_jobs.insert(call.key.job.clone());
                }
                Err(e) => {
                    warn!(job = %call.key.job, worker = %call.host, error = %e, "stop failed");
                    report.fail(Phase::Stop, &call.key.job, Some(&call.host), e);
                    failed.insert(call.key.id.clone());
                }
            }
        }

        for name in &stopped_jobs {
            let Some(job) = snapshot.job(name)? else {
                continue;
            };
            let hosts: Vec<String> = snapshot
                .allocations_for_job(name)?
                .into_iter()
                .filter(Allocation::is_active)
                .map(|a| a.worker)
                .collect();
            if let Err(e) = self.gate.verify(&job, &hosts, true).await {
                warn!(job = %name, error = %e, "unhealthy after stopping allocations");
                report.fail(Phase::Health, name, None, e);
            }
        }
        Ok(failed)
    }

    /// Write worker documents, rebuild this level's job trees and hash them.
    fn prepare_phase(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        sequence: u64,
    ) -> RolloutResult<Prepared> {
        let snapshot = self.store.snapshot()?;
        let mut workers = snapshot.workers()?;
        workers.sort_by_key(|w| w.ordinal);
        let allocations = snapshot.allocations()?;
        let specs: BTreeMap<String, Job> = snapshot
            .jobs()?
            .into_iter()
            .map(|job| (job.name.clone(), job))
            .collect();
        let root = &self.settings.remote_root;

        let mut prepared = Prepared::default();
        for worker in &workers {
            write_worker_documents(&self.layout, worker, &allocations, root, sequence)?;

            for alloc in allocations.iter().filter(|a| {
                a.worker == worker.ip && a.level == level && !a.removed && jobs.contains(&a.job)
            }) {
                let Some(job) = specs.get(&alloc.job) else {
                    continue;
                };
                let target = self.layout.job_dir(&worker.ip, &job.name);
                self.materialize(&snapshot, &workers, worker, job, &target)?;
                let hash = hash_tree(&target)?;

                let previous = snapshot.previous_hash(&ledger_namespace(&job.name), &alloc.id)?;
                if !alloc.disabled && hash != previous {
                    debug!(job = %job.name, worker = %worker.ip, "allocation content changed");
                    prepared.changed_jobs.insert(job.name.clone());
                    prepared.sync_workers.insert(worker.ip.clone());
                }
                prepared.hashes.insert(alloc.id.clone(), hash);
            }
        }
        debug!(
            level,
            allocations = prepared.hashes.len(),
            changed_jobs = prepared.changed_jobs.len(),
            "prepared"
        );
        Ok(prepared)
    }

    fn materialize(
        &self,
        snapshot: &impl StateRead,
        workers: &[Worker],
        worker: &Worker,
        job: &Job,
        target: &Path,
    ) -> RolloutResult<()> {
        let cert = if job.certificate {
            Some(self.issuer.issue(&job.name, worker)?)
        } else {
            None
        };
        let ctx = RenderContext {
            state: snapshot,
            worker,
            job,
            workers,
        };
        materialize_job(
            &ctx,
            &self.layout.artifact_dir(&job.name),
            target,
            &self.settings.remote_root,
            cert.as_ref(),
        )
    }

    /// Push prepared trees, scoped to this level's jobs. Returns the
    /// workers whose sync failed.
    async fn sync_phase(
        &self,
        workers: &BTreeSet<String>,
        jobs: &BTreeSet<String>,
        report: &mut DeployReport,
    ) -> BTreeSet<String> {
        let filter = SyncFilter::only(jobs.iter().cloned());
        let calls: Vec<_> = workers
            .iter()
            .map(|ip| {
                let call = RemoteCall::Sync {
                    local: self.layout.work_dir(ip),
                    remote: self.settings.remote_root.clone(),
                    filter: filter.clone(),
                };
                ((), ip.clone(), call)
            })
            .collect();
        let limit = calls.len();

        let mut failed = BTreeSet::new();
        for call in fan_out(&self.executor, calls, limit).await {
            if let Err(e) = call.result {
                warn!(worker = %call.host, error = %e, "sync failed");
                report.fail(Phase::Sync, "", Some(&call.host), e);
                failed.insert(call.host);
            }
        }
        failed
    }

    /// Record new content hashes and drop removed allocations.
    ///
    /// A removed allocation whose stop failed is kept for the next run only
    /// while its worker is still declared; a worker that left the
    /// declaration is never retried.
    fn hash_update_phase(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        hashes: &BTreeMap<String, String>,
        stop_failed: &BTreeSet<String>,
    ) -> RolloutResult<()> {
        let dropped = self.store.write(|tx| -> RolloutResult<_> {
            let mut dropped = Vec::new();
            for alloc in level_allocations(&*tx, level, jobs)? {
                let ns = ledger_namespace(&alloc.job);
                if alloc.removed {
                    if stop_failed.contains(&alloc.id) {
                        if tx.worker(&alloc.worker)?.is_some() {
                            continue;
                        }
                        warn!(
                            job = %alloc.job,
                            worker = %alloc.worker,
                            "dropping allocation of decommissioned worker without a clean stop"
                        );
                    }
                    tx.remove_hash(&ns, &alloc.id)?;
                    tx.delete_allocation(&alloc.id)?;
                    dropped.push(alloc);
                } else if let Some(hash) = hashes.get(&alloc.id) {
                    tx.update_hash(&ns, &alloc.id, hash)?;
                }
            }
            Ok(dropped)
        })?;

        for alloc in &dropped {
            debug!(job = %alloc.job, worker = %alloc.worker, "removed allocation dropped");
            remove_dir(&self.layout.job_dir(&alloc.worker, &alloc.job))?;
            self.issuer.revoke(&alloc.job, &alloc.worker)?;
        }
        Ok(())
    }

    /// Split this level's active allocations into new and updated, reading
    /// the ledger as committed by hash-update.
    fn classify(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        unsynced: &BTreeSet<String>,
    ) -> RolloutResult<Classified> {
        let snapshot = self.store.snapshot()?;
        let mut classified = Classified::default();

        for name in jobs {
            let Some(job) = snapshot.job(name)? else {
                continue;
            };
            let mut plan = JobApply {
                job,
                new: Vec::new(),
                updated: Vec::new(),
            };
            for alloc in snapshot.allocations_for_job(name)? {
                if alloc.level != level || !alloc.is_active() {
                    continue;
                }
                let Some(record) = snapshot.hash_record(&ledger_namespace(name), &alloc.id)? else {
                    continue;
                };
                if !record.is_changed() {
                    continue;
                }
                if unsynced.contains(&alloc.worker) {
                    classified.held.insert(alloc.id.clone());
                    continue;
                }
                if record.is_new() {
                    plan.new.push(alloc);
                } else {
                    plan.updated.push(alloc);
                }
            }
            plan.new.sort_by(|a, b| a.worker.cmp(&b.worker));
            plan.updated.sort_by(|a, b| a.worker.cmp(&b.worker));
            if !plan.is_empty() {
                debug!(
                    job = %name,
                    new = plan.new.len(),
                    updated = plan.updated.len(),
                    "classified"
                );
                classified.plans.push(plan);
            }
        }
        Ok(classified)
    }

    /// Apply every job of the level concurrently.
    async fn apply_phase(&self, plans: &[JobApply], report: &mut DeployReport) -> Vec<ApplyOutcome> {
        let mut set = JoinSet::new();
        for plan in plans {
            set.spawn(apply_job(
                Arc::clone(&self.executor),
                self.gate.clone(),
                self.settings.remote_root.clone(),
                plan.clone(),
            ));
        }

        let mut outcomes = Vec::with_capacity(plans.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        outcomes.sort_by(|a, b| a.job.cmp(&b.job));

        for outcome in &mut outcomes {
            report.started += outcome.started;
            report.restarted += outcome.restarted;
            report.halted += outcome.halted;
            report.failures.append(&mut outcome.failures);
            if outcome.halted > 0 {
                info!(job = %outcome.job, halted = outcome.halted, "allocations left for next deploy");
            }
        }
        outcomes
    }

    /// Promote what was applied or already current; reset disabled
    /// allocations so a re-enable starts them fresh.
    fn promote_phase(
        &self,
        level: u32,
        jobs: &BTreeSet<String>,
        attempted: &BTreeSet<&str>,
        applied: &BTreeSet<&str>,
        held: &BTreeSet<String>,
        stop_failed: &BTreeSet<String>,
    ) -> RolloutResult<usize> {
        self.store.write(|tx| -> RolloutResult<_> {
            let mut promoted = 0;
            for alloc in level_allocations(&*tx, level, jobs)? {
                if alloc.removed {
                    continue;
                }
                let ns = ledger_namespace(&alloc.job);
                if tx.hash_record(&ns, &alloc.id)?.is_none() {
                    continue;
                }
                if alloc.disabled {
                    if !stop_failed.contains(&alloc.id) {
                        tx.reset_hash(&ns, &alloc.id)?;
                    }
                    continue;
                }
                let id = alloc.id.as_str();
                if held.contains(id) || (attempted.contains(id) && !applied.contains(id)) {
                    continue;
                }
                if tx.promote_hash(&ns, id)? {
                    promoted += 1;
                }
            }
            Ok(promoted)
        })
    }

    /// Rewrite every worker's documents, fill in missing job trees and
    /// mirror each worker unscoped.
    async fn final_pass(&self, sequence: u64, report: &mut DeployReport) -> RolloutResult<()> {
        let snapshot = self.store.snapshot()?;
        let mut workers = snapshot.workers()?;
        workers.sort_by_key(|w| w.ordinal);
        let allocations = snapshot.allocations()?;
        let specs: BTreeMap<String, Job> = snapshot
            .jobs()?
            .into_iter()
            .map(|job| (job.name.clone(), job))
            .collect();
        let root = &self.settings.remote_root;

        for worker in &workers {
            write_worker_documents(&self.layout, worker, &allocations, root, sequence)?;
            for alloc in allocations
                .iter()
                .filter(|a| a.worker == worker.ip && !a.removed)
            {
                let target = self.layout.job_dir(&worker.ip, &alloc.job);
                if target.exists() {
                    continue;
                }
                if let Some(job) = specs.get(&alloc.job) {
                    self.materialize(&snapshot, &workers, worker, job, &target)?;
                }
            }
        }
        self.prune_work_dirs(&workers)?;

        let calls: Vec<_> = workers
            .iter()
            .map(|worker| {
                let call = RemoteCall::Sync {
                    local: self.layout.work_dir(&worker.ip),
                    remote: root.clone(),
                    filter: SyncFilter::all(),
                };
                ((), worker.ip.clone(), call)
            })
            .collect();
        let limit = calls.len();
        for call in fan_out(&self.executor, calls, limit).await {
            if let Err(e) = call.result {
                warn!(worker = %call.host, error = %e, "final sync failed");
                report.fail(Phase::FinalSync, "", Some(&call.host), e);
            }
        }
        debug!(workers = workers.len(), "final pass complete");
        Ok(())
    }

    fn prune_work_dirs(&self, workers: &[Worker]) -> RolloutResult<()> {
        let root = self.layout.work_root();
        if !root.is_dir() {
            return Ok(());
        }
        let live: BTreeSet<&str> = workers.iter().map(|w| w.ip.as_str()).collect();
        for entry in fs::read_dir(&root).map_err(io_err(&root))? {
            let entry = entry.map_err(io_err(&root))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live.contains(name.as_str()) {
                debug!(worker = %name, "pruning work dir of undeclared worker");
                remove_dir(&entry.path())?;
            }
        }
        Ok(())
    }

    // ── Hooks ──────────────────────────────────────────────────────

    /// Run a job's hooks for `event` on this host, serially, in `dir`.
    async fn run_hooks(&self, job: &Job, event: CommandEvent, dir: &Path) -> RolloutResult<()> {
        let env = vec![
            ("HOIST_JOB".to_string(), job.name.clone()),
            ("HOIST_JOB_VERSION".to_string(), job.version.clone()),
        ];
        for (name, command) in job.commands_for(event) {
            info!(job = %job.name, command = %name, event = event.as_str(), "running hook");
            self.executor
                .run_local(dir, &command.run, &env)
                .await
                .map_err(|source| RolloutError::Hook {
                    job: job.name.clone(),
                    event: event.as_str(),
                    command: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Deploy-time hooks: failures are reported, not fatal.
    async fn run_deploy_hooks(
        &self,
        name: &str,
        event: CommandEvent,
        report: &mut DeployReport,
    ) -> RolloutResult<()> {
        let Some(job) = self.store.job(name)? else {
            return Ok(());
        };
        let phase = match event {
            CommandEvent::PreDeploy => Phase::PreDeploy,
            _ => Phase::PostDeploy,
        };
        if let Err(e) = self
            .run_hooks(&job, event, &self.layout.artifact_dir(name))
            .await
        {
            warn!(job = %name, error = %e, "hook failed");
            report.fail(phase, name, None, e);
        }
        Ok(())
    }

    // ── Bulk commands ──────────────────────────────────────────────

    /// Run a job's `direct` command on every active allocation.
    pub async fn run_command(
        &self,
        job: &str,
        command: &str,
    ) -> RolloutResult<Vec<(String, CommandOutput)>> {
        let stored = self
            .store
            .job(job)?
            .ok_or_else(|| RolloutError::UnknownJob(job.to_string()))?;
        let declared = stored
            .commands
            .get(command)
            .filter(|c| c.runs_on(CommandEvent::Direct))
            .ok_or_else(|| RolloutError::UnknownCommand {
                job: job.to_string(),
                command: command.to_string(),
            })?;
        let line = job_command(&self.settings.remote_root, job, &declared.run);
        self.on_allocations(job, RemoteCall::Command(line)).await
    }

    /// Run a local script on every active allocation of `job`.
    pub async fn run_script(
        &self,
        job: &str,
        script: &Path,
    ) -> RolloutResult<Vec<(String, CommandOutput)>> {
        if self.store.job(job)?.is_none() {
            return Err(RolloutError::UnknownJob(job.to_string()));
        }
        if !script.is_file() {
            return Err(RolloutError::Io {
                path: script.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.on_allocations(job, RemoteCall::Script(script.to_path_buf()))
            .await
    }

    async fn on_allocations(
        &self,
        job: &str,
        call: RemoteCall,
    ) -> RolloutResult<Vec<(String, CommandOutput)>> {
        let calls: Vec<_> = self
            .store
            .allocations_for_job(job)?
            .into_iter()
            .filter(Allocation::is_active)
            .map(|alloc| ((), alloc.worker, call.clone()))
            .collect();
        let total = calls.len();

        let mut outputs = Vec::new();
        let mut failed = 0;
        for result in fan_out(&self.executor, calls, total).await {
            match result.result {
                Ok(output) => outputs.push((result.host, output)),
                Err(e) => {
                    warn!(%job, worker = %result.host, error = %e, "command failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(RolloutError::WorkersFailed { failed, total });
        }
        info!(%job, workers = total, "command succeeded everywhere");
        Ok(outputs)
    }

    // ── Status ─────────────────────────────────────────────────────

    /// Every allocation with its ledger state.
    pub fn status(&self) -> RolloutResult<Vec<AllocationStatus>> {
        let snapshot = self.store.snapshot()?;
        let mut rows = Vec::new();
        for alloc in snapshot.allocations()? {
            let ledger = match snapshot.hash_record(&ledger_namespace(&alloc.job), &alloc.id)? {
                None => LedgerState::Unknown,
                Some(record) if record.is_new() => LedgerState::New,
                Some(record) if record.is_changed() => LedgerState::Changed,
                Some(_) => LedgerState::Applied,
            };
            rows.push(AllocationStatus {
                allocation: alloc,
                ledger,
            });
        }
        rows.sort_by(|a, b| {
            (a.allocation.level, &a.allocation.job, &a.allocation.worker).cmp(&(
                b.allocation.level,
                &b.allocation.job,
                &b.allocation.worker,
            ))
        });
        Ok(rows)
    }
}

/// Allocations of `jobs` stamped with `level`.
fn level_allocations(
    state: &impl StateRead,
    level: u32,
    jobs: &BTreeSet<String>,
) -> RolloutResult<Vec<Allocation>> {
    Ok(state
        .allocations()?
        .into_iter()
        .filter(|a| a.level == level && jobs.contains(&a.job))
        .collect())
}
