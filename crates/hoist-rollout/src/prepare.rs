//! Local materialization of worker trees.
//!
//! Everything a worker receives is first written under
//! `<state_dir>/work/<ip>/` and then mirrored with one sync. Job trees are
//! rebuilt from the build-time artifact snapshot on every deploy; their
//! content hash is what the ledger tracks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use hoist_core::{Allocation, Job, Worker};
use hoist_state::StateRead;
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::certs::IssuedCert;
use crate::error::{RolloutError, RolloutResult, io_err};
use crate::layout::{AGENT_SCRIPT, Layout};
use crate::render::{RenderContext, RenderError, TEMPLATE_SUFFIX};

const AGENT_BODY: &str = include_str!("../assets/hoist-agent.sh");

const HELPER_DIR: &str = ".hoist";
const CERTS_DIR: &str = "certs";

/// Shell helpers every job can source.
const LIB_MODULE: &str = r#"# hoist shell helpers
hoist_log() {
    echo "[$HOIST_JOB@$HOIST_WORKER_IP] $*"
}

hoist_wait_for_port() {
    port="$1"
    tries="${2:-30}"
    while [ "$tries" -gt 0 ]; do
        if nc -z 127.0.0.1 "$port" 2>/dev/null; then
            return 0
        fi
        tries=$((tries - 1))
        sleep 1
    done
    return 1
}
"#;

#[derive(Serialize)]
struct WorkerDocument<'a> {
    ip: &'a str,
    ordinal: u32,
    labels: Vec<&'a str>,
    tags: &'a BTreeMap<String, String>,
    memory_mb: u64,
    cpu_mhz: u64,
    remote_root: &'a str,
    update_sequence: u64,
}

#[derive(Serialize)]
struct AllocationEntry<'a> {
    job: &'a str,
    disabled: bool,
}

/// Write `worker.json`, `allocations.json` and the agent script.
///
/// `allocations` are the worker's rows; removed ones are left out.
pub fn write_worker_documents(
    layout: &Layout,
    worker: &Worker,
    allocations: &[Allocation],
    remote_root: &str,
    update_sequence: u64,
) -> RolloutResult<()> {
    let dir = layout.work_dir(&worker.ip);
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;

    let doc = WorkerDocument {
        ip: &worker.ip,
        ordinal: worker.ordinal,
        labels: worker.labels.iter().map(String::as_str).collect(),
        tags: &worker.tags,
        memory_mb: worker.memory_mb,
        cpu_mhz: worker.cpu_mhz,
        remote_root,
        update_sequence,
    };
    write_json(&dir.join("worker.json"), &doc)?;

    let entries: Vec<AllocationEntry<'_>> = allocations
        .iter()
        .filter(|alloc| alloc.worker == worker.ip && !alloc.removed)
        .map(|alloc| AllocationEntry {
            job: &alloc.job,
            disabled: alloc.disabled,
        })
        .collect();
    write_json(&dir.join("allocations.json"), &entries)?;

    let agent = dir.join("agent").join(AGENT_SCRIPT);
    write_file(&agent, AGENT_BODY.as_bytes())?;
    set_executable(&agent)?;
    Ok(())
}

/// Replace `dst` with a copy of `src`.
pub fn snapshot_artifacts(src: &Path, dst: &Path) -> RolloutResult<()> {
    remove_dir(dst)?;
    copy_tree(src, dst)
}

/// Rebuild one job tree at `target` from its artifact snapshot: copy plain
/// files, render templates, add the helper modules and certificates.
pub fn materialize_job<S: StateRead>(
    ctx: &RenderContext<'_, S>,
    artifact_dir: &Path,
    target: &Path,
    remote_root: &str,
    cert: Option<&IssuedCert>,
) -> RolloutResult<()> {
    remove_dir(target)?;
    fs::create_dir_all(target).map_err(io_err(target))?;

    for entry in WalkDir::new(artifact_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_err(artifact_dir, e))?;
        let rel = relative(artifact_dir, entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            let dir = target.join(&rel);
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            continue;
        }

        let name = rel.to_string_lossy();
        if let Some(stripped) = name.strip_suffix(TEMPLATE_SUFFIX) {
            let source = fs::read_to_string(entry.path()).map_err(io_err(entry.path()))?;
            let rendered = ctx.render(&source).map_err(|e| RenderError::InFile {
                path: format!("{}/{name}", ctx.job.name),
                source: Box::new(e),
            })?;
            let out = target.join(stripped);
            write_file(&out, rendered.as_bytes())?;
            copy_permissions(entry.path(), &out)?;
        } else {
            let out = target.join(&rel);
            fs::copy(entry.path(), &out).map_err(io_err(&out))?;
        }
    }

    let helpers = target.join(HELPER_DIR);
    write_file(
        &helpers.join("env.sh"),
        env_module(ctx.job, ctx.worker, remote_root).as_bytes(),
    )?;
    write_file(&helpers.join("lib.sh"), LIB_MODULE.as_bytes())?;

    if let Some(cert) = cert {
        let certs = target.join(CERTS_DIR);
        write_file(&certs.join("cert.pem"), cert.cert_pem.as_bytes())?;
        write_file(&certs.join("key.pem"), cert.key_pem.as_bytes())?;
        write_file(&certs.join("ca.pem"), cert.ca_pem.as_bytes())?;
    }
    Ok(())
}

/// Environment module sourced before every job command.
fn env_module(job: &Job, worker: &Worker, remote_root: &str) -> String {
    let root = remote_root.trim_end_matches('/');
    let mut vars = vec![
        ("HOIST_JOB".to_string(), job.name.clone()),
        ("HOIST_JOB_VERSION".to_string(), job.version.clone()),
        ("HOIST_WORKER_IP".to_string(), worker.ip.clone()),
        ("HOIST_WORKER_ORDINAL".to_string(), worker.ordinal.to_string()),
        ("HOIST_ROOT".to_string(), root.to_string()),
        ("HOIST_JOB_DIR".to_string(), hoist_core::job_dir(root, &job.name)),
    ];
    for (name, port) in &job.ports {
        let var = format!("HOIST_PORT_{}", name.to_uppercase().replace('-', "_"));
        vars.push((var, port.to_string()));
    }

    let mut out = String::from("# generated by hoist\n");
    for (key, value) in vars {
        out.push_str(&format!("export {key}={}\n", shell_quote(&value)));
    }
    out.push_str(". \"$HOIST_JOB_DIR/.hoist/lib.sh\"\n");
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Content hash of a directory tree: relative paths and file bytes, in
/// path order.
pub fn hash_tree(dir: &Path) -> RolloutResult<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_err(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative(dir, entry.path());
        let bytes = fs::read(entry.path()).map_err(io_err(entry.path()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copy `src` into `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> RolloutResult<()> {
    fs::create_dir_all(dst).map_err(io_err(dst))?;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_err(src, e))?;
        let out = dst.join(relative(src, entry.path()));
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(io_err(&out))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &out).map_err(io_err(&out))?;
        }
    }
    Ok(())
}

/// Remove a directory tree if it exists.
pub fn remove_dir(dir: &Path) -> RolloutResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err(dir))?;
    }
    Ok(())
}

fn relative(base: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(base).unwrap_or(path).to_path_buf()
}

fn walk_err(root: &Path, err: walkdir::Error) -> RolloutError {
    let path = err.path().unwrap_or(root).to_path_buf();
    RolloutError::Io {
        path,
        source: err.into(),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> RolloutResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::write(path, contents).map_err(io_err(path))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> RolloutResult<()> {
    let mut body = serde_json::to_vec_pretty(value).map_err(|e| RolloutError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    body.push(b'\n');
    write_file(path, &body)
}

fn copy_permissions(from: &Path, to: &Path) -> RolloutResult<()> {
    let perms = fs::metadata(from).map_err(io_err(from))?.permissions();
    fs::set_permissions(to, perms).map_err(io_err(to))
}

fn set_executable(path: &Path) -> RolloutResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_err(path))?;
    }
    Ok(())
}
