//! Declaration loading.
//!
//! A project directory looks like:
//!
//! ```text
//! hoist.toml            [settings], [[worker]] entries, [disable] overrides
//! jobs/<name>/job.toml  one job declaration
//! jobs/<name>/files/    the job's file tree (templates, service.sh, ...)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::Settings;
use crate::types::*;

pub const PROJECT_FILE: &str = "hoist.toml";
pub const JOB_FILE: &str = "job.toml";
pub const JOBS_DIR: &str = "jobs";
pub const FILES_DIR: &str = "files";

/// Errors raised while reading declaration files.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default, rename = "worker")]
    workers: Vec<WorkerDecl>,
    #[serde(default)]
    disable: DisableOverrides,
}

#[derive(Debug, Deserialize)]
struct WorkerDecl {
    ip: String,
    #[serde(default)]
    memory_mb: u64,
    #[serde(default)]
    cpu_mhz: u64,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    name: Option<String>,
    version: String,
    #[serde(default)]
    memory: ResourceRange,
    #[serde(default)]
    cpu: ResourceRange,
    #[serde(default)]
    selectors: Vec<String>,
    #[serde(default = "default_parallel")]
    update_parallel_count: u32,
    #[serde(default)]
    commands: BTreeMap<String, CommandDecl>,
    #[serde(default)]
    ports: BTreeMap<String, u16>,
    #[serde(default)]
    certificate: bool,
}

fn default_parallel() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct CommandDecl {
    run: String,
    #[serde(default)]
    on: Vec<CommandEvent>,
    depends_on: Option<CommandRef>,
}

/// A job as declared on disk, before validation.
#[derive(Debug, Clone)]
pub struct DeclaredJob {
    pub job: Job,
    /// Name of the directory under `jobs/`.
    pub dir_name: String,
    pub dir: PathBuf,
}

impl DeclaredJob {
    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }
}

/// Everything declared in a project directory.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub settings: Settings,
    /// Workers in declaration order; `ordinal` is the index.
    pub workers: Vec<Worker>,
    /// Jobs sorted by name.
    pub jobs: Vec<DeclaredJob>,
    pub disable: DisableOverrides,
}

impl Project {
    /// Load `hoist.toml` and every `jobs/*/job.toml` under `root`.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let project_path = root.join(PROJECT_FILE);
        let file: ProjectFile = read_toml(&project_path)?;

        let workers = file
            .workers
            .into_iter()
            .enumerate()
            .map(|(ordinal, decl)| {
                let mut worker = Worker::new(&decl.ip, ordinal as u32).with_labels(decl.labels);
                worker.memory_mb = decl.memory_mb;
                worker.cpu_mhz = decl.cpu_mhz;
                worker.tags = decl.tags;
                worker
            })
            .collect();

        let jobs = load_jobs(&root.join(JOBS_DIR))?;

        Ok(Self {
            root: root.to_path_buf(),
            settings: file.settings,
            workers,
            jobs,
            disable: file.disable,
        })
    }

    /// State directory resolved against the project root.
    pub fn state_dir(&self) -> PathBuf {
        if self.settings.state_dir.is_absolute() {
            self.settings.state_dir.clone()
        } else {
            self.root.join(&self.settings.state_dir)
        }
    }

    pub fn job(&self, name: &str) -> Option<&DeclaredJob> {
        self.jobs.iter().find(|declared| declared.job.name == name)
    }

    pub fn job_specs(&self) -> Vec<Job> {
        self.jobs.iter().map(|declared| declared.job.clone()).collect()
    }
}

fn load_jobs(jobs_dir: &Path) -> Result<Vec<DeclaredJob>, ManifestError> {
    if !jobs_dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(jobs_dir).map_err(|source| ManifestError::Io {
        path: jobs_dir.to_path_buf(),
        source,
    })?;

    let mut jobs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ManifestError::Io {
            path: jobs_dir.to_path_buf(),
            source,
        })?;
        let dir = entry.path();
        let job_path = dir.join(JOB_FILE);
        if !job_path.is_file() {
            continue;
        }

        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let file: JobFile = read_toml(&job_path)?;
        jobs.push(DeclaredJob {
            job: job_from_file(file, &dir_name),
            dir_name,
            dir,
        });
    }

    jobs.sort_by(|a, b| a.job.name.cmp(&b.job.name));
    Ok(jobs)
}

fn job_from_file(file: JobFile, dir_name: &str) -> Job {
    let commands = file
        .commands
        .into_iter()
        .map(|(name, decl)| {
            let command = JobCommand {
                run: decl.run,
                on: decl.on.into_iter().collect::<BTreeSet<_>>(),
                depends_on: decl.depends_on,
            };
            (name, command)
        })
        .collect();

    Job {
        name: file.name.unwrap_or_else(|| dir_name.to_string()),
        version: file.version,
        memory: file.memory,
        cpu: file.cpu,
        selectors: file.selectors.into_iter().collect(),
        update_parallel_count: file.update_parallel_count,
        commands,
        ports: file.ports,
        certificate: file.certificate,
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_project(root: &Path) {
        fs::write(
            root.join(PROJECT_FILE),
            r#"
[settings]
remote_root = "/srv/hoist"

[[worker]]
ip = "10.0.0.1"
memory_mb = 4096
labels = ["web"]
tags = { zone = "a" }

[[worker]]
ip = "10.0.0.2"
labels = ["db"]

[disable]
jobs = ["batch"]
allocations = [{ job = "web", worker = "10.0.0.2" }]
"#,
        )
        .unwrap();

        let web = root.join(JOBS_DIR).join("web");
        fs::create_dir_all(web.join(FILES_DIR)).unwrap();
        fs::write(
            web.join(JOB_FILE),
            r#"
version = "1.4.0"
selectors = ["web"]
update_parallel_count = 2

[ports]
http = 8080

[commands.migrate]
run = "./migrate.sh"
on = ["pre_deploy"]
depends_on = { job = "db", command = "ready" }

[commands.ping]
run = "curl -sf localhost:8080/healthz"
on = ["health_check", "direct"]
"#,
        )
        .unwrap();
    }

    #[test]
    fn loads_workers_jobs_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());

        let project = Project::load(dir.path()).unwrap();
        assert_eq!(project.settings.remote_root, "/srv/hoist");
        assert_eq!(project.workers.len(), 2);

        let first = &project.workers[0];
        assert_eq!(first.ordinal, 0);
        assert!(first.has_label("web"));
        assert!(first.has_label(WORKER_LABEL));
        assert_eq!(first.tags.get("zone").map(String::as_str), Some("a"));
        assert_eq!(project.workers[1].ordinal, 1);

        let web = project.job("web").unwrap();
        assert_eq!(web.job.version, "1.4.0");
        assert_eq!(web.job.update_parallel_count, 2);
        assert_eq!(web.job.ports.get("http"), Some(&8080));
        assert_eq!(web.job.dependency_jobs().into_iter().collect::<Vec<_>>(), vec!["db"]);
        assert_eq!(web.job.commands_for(CommandEvent::HealthCheck).count(), 1);

        assert!(project.disable.disables("batch", "10.0.0.1"));
        assert!(project.disable.disables("web", "10.0.0.2"));
    }

    #[test]
    fn missing_jobs_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_FILE), "").unwrap();
        let project = Project::load(dir.path()).unwrap();
        assert!(project.jobs.is_empty());
        assert!(project.workers.is_empty());
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_FILE), "[[worker]]\nip = 5").unwrap();
        let err = Project::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(err.to_string().contains(PROJECT_FILE));
    }
}
