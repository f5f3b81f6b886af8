use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hoist_core::Project;
use hoist_rollout::{Layout, Orchestrator, SshExecutor};
use hoist_state::StateStore;

pub mod exec;
pub mod kv;
pub mod rollout;

fn load_project(path: &Path) -> anyhow::Result<Project> {
    Project::load(path).with_context(|| format!("loading project at {}", path.display()))
}

/// Load the project and open an orchestrator over SSH.
fn orchestrator(path: &Path) -> anyhow::Result<(Project, Orchestrator)> {
    let project = load_project(path)?;
    let executor = Arc::new(SshExecutor::new(&project.settings.ssh));
    let orch = Orchestrator::open(&project, executor)?;
    Ok((project, orch))
}

/// Open the state store alone, for commands that never touch workers.
fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    let project = load_project(path)?;
    let state_dir = project.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating {}", state_dir.display()))?;
    Ok(StateStore::open(&Layout::new(&state_dir).db_path())?)
}
