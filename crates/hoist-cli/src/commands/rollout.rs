use std::path::Path;

use hoist_rollout::{DeployReport, LedgerState};
use tracing::warn;

pub async fn build(path: &Path) -> anyhow::Result<()> {
    let (project, orch) = super::orchestrator(path)?;
    let summary = orch.build(&project).await?;

    println!(
        "✓ Built {} job(s) on {} worker(s), {} level(s)",
        summary.jobs,
        summary.workers,
        summary.max_level + 1
    );
    let schedule = summary.schedule;
    println!(
        "  allocations: {} assigned, {} added, {} removed, {} disabled",
        schedule.assigned, schedule.added, schedule.removed, schedule.disabled
    );
    Ok(())
}

pub async fn deploy(path: &Path, jobs: &[String], json: bool) -> anyhow::Result<()> {
    let (_, orch) = super::orchestrator(path)?;
    let report = orch.deploy(jobs).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            "deploy finished with failures; rerun to retry"
        );
    }
    Ok(())
}

fn print_report(report: &DeployReport) {
    let mark = if report.is_clean() { "✓" } else { "!" };
    println!(
        "{mark} Deploy #{}: {} started, {} restarted, {} stopped, {} promoted",
        report.sequence, report.started, report.restarted, report.stopped, report.promoted
    );
    if report.halted > 0 {
        println!("  {} updated allocations held for the next deploy", report.halted);
    }
    for failure in &report.failures {
        println!("  ✗ {failure}");
    }
}

pub fn status(path: &Path, json: bool) -> anyhow::Result<()> {
    let (_, orch) = super::orchestrator(path)?;
    let rows = orch.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<6} {:<24} {:<16} {:<10} LEDGER", "LEVEL", "JOB", "WORKER", "STATE");
    for row in &rows {
        let alloc = &row.allocation;
        let state = if alloc.removed {
            "removed"
        } else if alloc.disabled {
            "disabled"
        } else {
            "active"
        };
        let ledger = match row.ledger {
            LedgerState::Unknown => "unknown",
            LedgerState::New => "new",
            LedgerState::Changed => "changed",
            LedgerState::Applied => "applied",
        };
        println!(
            "{:<6} {:<24} {:<16} {:<10} {ledger}",
            alloc.level, alloc.job, alloc.worker, state
        );
    }
    Ok(())
}
