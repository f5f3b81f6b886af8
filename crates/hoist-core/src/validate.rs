//! Declaration validation.
//!
//! Every check runs and the failures are returned together, so an operator
//! sees the full list in one pass. Nothing in here touches state; callers
//! validate before any mutation or remote side effect.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::config::parse_duration;
use crate::manifest::{DeclaredJob, Project};

/// File every job tree must provide; the worker agent drives it.
pub const SERVICE_SCRIPT: &str = "service.sh";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid name regex"));

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid {kind} name {name:?} (expected [a-z0-9][a-z0-9_-]*)")]
    InvalidName { kind: &'static str, name: String },

    #[error("job directory {dir:?} declares name {name:?}")]
    NameMismatch { dir: String, name: String },

    #[error("job {0:?} is declared more than once")]
    DuplicateJob(String),

    #[error("worker {0:?} is declared more than once")]
    DuplicateWorker(String),

    #[error("worker address {0:?} is not an IP address")]
    InvalidAddress(String),

    #[error("job {job:?}: {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("job {job:?} command {command:?} depends on its own job")]
    SelfDependency { job: String, command: String },

    #[error("job {job:?} command {command:?} depends on unknown command {target}")]
    UnknownDependency {
        job: String,
        command: String,
        target: String,
    },

    #[error("job {job:?} is missing required artifact {path}")]
    MissingArtifact { job: String, path: String },

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

/// All problems found in a declaration set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

/// Validate a whole project declaration.
pub fn validate_project(project: &Project) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    validate_settings(project, &mut errors);
    validate_workers(project, &mut errors);

    let mut seen = BTreeSet::new();
    for declared in &project.jobs {
        if !seen.insert(declared.job.name.as_str()) {
            errors.push(ValidationError::DuplicateJob(declared.job.name.clone()));
        }
        validate_job(declared, &mut errors);
    }

    let commands: BTreeMap<&str, BTreeSet<&str>> = project
        .jobs
        .iter()
        .map(|declared| {
            let names = declared.job.commands.keys().map(String::as_str).collect();
            (declared.job.name.as_str(), names)
        })
        .collect();
    for declared in &project.jobs {
        validate_dependencies(declared, &commands, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn check_name(kind: &'static str, name: &str, errors: &mut Vec<ValidationError>) {
    if !NAME_RE.is_match(name) {
        errors.push(ValidationError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
}

fn validate_settings(project: &Project, errors: &mut Vec<ValidationError>) {
    let settings = &project.settings;
    if settings.max_in_flight == 0 {
        errors.push(ValidationError::InvalidSetting {
            key: "max_in_flight",
            reason: "must be at least 1".to_string(),
        });
    }
    if settings.health.attempts == 0 {
        errors.push(ValidationError::InvalidSetting {
            key: "health.attempts",
            reason: "must be at least 1".to_string(),
        });
    }
    if !settings.remote_root.starts_with('/') {
        errors.push(ValidationError::InvalidSetting {
            key: "remote_root",
            reason: format!("{:?} is not an absolute path", settings.remote_root),
        });
    }
    for (key, value) in [
        ("health.delay", &settings.health.delay),
        ("ssh.connect_timeout", &settings.ssh.connect_timeout),
        ("ssh.command_timeout", &settings.ssh.command_timeout),
    ] {
        if parse_duration(value).is_none() {
            errors.push(ValidationError::InvalidSetting {
                key,
                reason: format!("{value:?} is not a duration"),
            });
        }
    }
}

fn validate_workers(project: &Project, errors: &mut Vec<ValidationError>) {
    let mut seen = BTreeSet::new();
    for worker in &project.workers {
        if worker.ip.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress(worker.ip.clone()));
        }
        if !seen.insert(worker.ip.as_str()) {
            errors.push(ValidationError::DuplicateWorker(worker.ip.clone()));
        }
        for label in &worker.labels {
            check_name("label", label, errors);
        }
        for tag in worker.tags.keys() {
            check_name("tag", tag, errors);
        }
    }
}

fn validate_job(declared: &DeclaredJob, errors: &mut Vec<ValidationError>) {
    let job = &declared.job;
    check_name("job", &job.name, errors);
    if job.name != declared.dir_name {
        errors.push(ValidationError::NameMismatch {
            dir: declared.dir_name.clone(),
            name: job.name.clone(),
        });
    }

    let invalid = |reason: &str| ValidationError::InvalidJob {
        job: job.name.clone(),
        reason: reason.to_string(),
    };

    if job.version.trim().is_empty() {
        errors.push(invalid("version must not be empty"));
    }
    if job.update_parallel_count == 0 {
        errors.push(invalid("update_parallel_count must be at least 1"));
    }
    if job.memory.max > 0 && job.memory.min > job.memory.max {
        errors.push(invalid("memory.min exceeds memory.max"));
    }
    if job.cpu.max > 0 && job.cpu.min > job.cpu.max {
        errors.push(invalid("cpu.min exceeds cpu.max"));
    }

    for selector in &job.selectors {
        check_name("selector", selector, errors);
    }

    let mut port_numbers = BTreeSet::new();
    for (name, port) in &job.ports {
        check_name("port", name, errors);
        if *port == 0 {
            errors.push(invalid(&format!("port {name} must not be 0")));
        }
        if !port_numbers.insert(*port) {
            errors.push(invalid(&format!("port number {port} is declared twice")));
        }
    }

    for (name, command) in &job.commands {
        check_name("command", name, errors);
        if command.run.trim().is_empty() {
            errors.push(invalid(&format!("command {name} has an empty run line")));
        }
        if command.on.is_empty() {
            errors.push(invalid(&format!("command {name} is not attached to any event")));
        }
    }

    let service = declared.files_dir().join(SERVICE_SCRIPT);
    if !service.is_file() {
        errors.push(ValidationError::MissingArtifact {
            job: job.name.clone(),
            path: format!("files/{SERVICE_SCRIPT}"),
        });
    }
}

fn validate_dependencies(
    declared: &DeclaredJob,
    commands: &BTreeMap<&str, BTreeSet<&str>>,
    errors: &mut Vec<ValidationError>,
) {
    let job = &declared.job;
    for (name, command) in &job.commands {
        let Some(dep) = &command.depends_on else {
            continue;
        };
        if dep.job == job.name {
            errors.push(ValidationError::SelfDependency {
                job: job.name.clone(),
                command: name.clone(),
            });
            continue;
        }
        let known = commands
            .get(dep.job.as_str())
            .is_some_and(|names| names.contains(dep.command.as_str()));
        if !known {
            errors.push(ValidationError::UnknownDependency {
                job: job.name.clone(),
                command: name.clone(),
                target: format!("{}/{}", dep.job, dep.command),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::types::*;
    use crate::DisableOverrides;
    use std::path::Path;

    fn declared(root: &Path, job: Job, with_service: bool) -> DeclaredJob {
        let dir = root.join(&job.name);
        std::fs::create_dir_all(dir.join("files")).unwrap();
        if with_service {
            std::fs::write(dir.join("files").join(SERVICE_SCRIPT), "#!/bin/sh\n").unwrap();
        }
        DeclaredJob {
            dir_name: job.name.clone(),
            dir,
            job,
        }
    }

    fn project(root: &Path, jobs: Vec<DeclaredJob>) -> Project {
        Project {
            root: root.to_path_buf(),
            settings: Settings::default(),
            workers: vec![Worker::new("10.0.0.1", 0), Worker::new("10.0.0.2", 1)],
            jobs,
            disable: DisableOverrides::default(),
        }
    }

    fn command(on: CommandEvent, depends_on: Option<(&str, &str)>) -> JobCommand {
        JobCommand {
            run: "true".to_string(),
            on: BTreeSet::from([on]),
            depends_on: depends_on.map(|(job, command)| CommandRef {
                job: job.to_string(),
                command: command.to_string(),
            }),
        }
    }

    #[test]
    fn valid_project_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Job::new("db");
        db.commands.insert("ready".into(), command(CommandEvent::HealthCheck, None));
        let mut api = Job::new("api");
        api.commands.insert(
            "migrate".into(),
            command(CommandEvent::PreDeploy, Some(("db", "ready"))),
        );

        let jobs = vec![declared(dir.path(), api, true), declared(dir.path(), db, true)];
        assert!(validate_project(&project(dir.path(), jobs)).is_ok());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = Job::new("api");
        api.commands.insert("warm".into(), command(CommandEvent::Direct, None));
        api.commands.insert(
            "migrate".into(),
            command(CommandEvent::PreDeploy, Some(("api", "warm"))),
        );

        let err = validate_project(&project(dir.path(), vec![declared(dir.path(), api, true)]))
            .unwrap_err();
        assert!(err.errors().contains(&ValidationError::SelfDependency {
            job: "api".into(),
            command: "migrate".into(),
        }));
    }

    #[test]
    fn errors_are_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = Job::new("Bad_Name");
        bad.update_parallel_count = 0;
        bad.ports.insert("http".into(), 8080);
        bad.ports.insert("admin".into(), 8080);
        bad.commands.insert(
            "migrate".into(),
            command(CommandEvent::PreDeploy, Some(("ghost", "ready"))),
        );

        let mut p = project(dir.path(), vec![declared(dir.path(), bad, false)]);
        p.workers.push(Worker::new("10.0.0.1", 2));
        p.workers.push(Worker::new("not-an-ip", 3));

        let err = validate_project(&p).unwrap_err();
        let errors = err.errors();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidName { kind: "job", .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidJob { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownDependency { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::MissingArtifact { .. })));
        assert!(errors.contains(&ValidationError::DuplicateWorker("10.0.0.1".into())));
        assert!(errors.contains(&ValidationError::InvalidAddress("not-an-ip".into())));
        assert!(err.to_string().starts_with(&format!("{} configuration error(s)", errors.len())));
    }

    #[test]
    fn unknown_dependency_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = Job::new("db");
        let mut api = Job::new("api");
        api.commands.insert(
            "migrate".into(),
            command(CommandEvent::PreDeploy, Some(("db", "missing"))),
        );
        let jobs = vec![declared(dir.path(), api, true), declared(dir.path(), db, true)];
        let err = validate_project(&project(dir.path(), jobs)).unwrap_err();
        assert_eq!(err.errors().len(), 1);
    }

    #[test]
    fn bad_settings_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = project(dir.path(), Vec::new());
        p.settings.max_in_flight = 0;
        p.settings.remote_root = "relative/path".into();
        p.settings.health.delay = "whenever".into();
        let err = validate_project(&p).unwrap_err();
        assert_eq!(err.errors().len(), 3);
    }

    #[test]
    fn overflowing_duration_is_a_setting_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = project(dir.path(), Vec::new());
        p.settings.ssh.command_timeout = "999999999999999999m".into();
        let err = validate_project(&p).unwrap_err();
        assert!(matches!(
            err.errors(),
            [ValidationError::InvalidSetting { key: "ssh.command_timeout", .. }]
        ));
    }
}
