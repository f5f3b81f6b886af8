//! SSH/rsync transport.
//!
//! Shells out to the system `ssh` and `rsync` binaries. Each call gets a
//! connect timeout (passed to ssh) and a hard execution timeout; a process
//! that outlives the deadline is killed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use hoist_core::{CommandOutput, ExecError, ExecFuture, RemoteExecutor, SshSettings, SyncFilter};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// [`RemoteExecutor`] backed by OpenSSH and rsync.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    settings: SshSettings,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(settings: &SshSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            settings: settings.clone(),
        }
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{host}", self.settings.user)
    }

    /// Options shared by ssh invocations and rsync's remote shell.
    fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.settings.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn ssh_args(&self, host: &str, remote_command: &str) -> Vec<String> {
        let mut args = self.ssh_options();
        args.push(self.destination(host));
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    fn rsync_args(
        &self,
        host: &str,
        local_dir: &Path,
        remote_dir: &str,
        filter: &SyncFilter,
    ) -> Vec<String> {
        let remote_dir = remote_dir.trim_end_matches('/');
        let mut args = vec![
            "-a".to_string(),
            "--delete".to_string(),
            "-e".to_string(),
            format!("ssh {}", self.ssh_options().join(" ")),
            format!("--rsync-path=mkdir -p {remote_dir} && rsync"),
        ];
        for rule in filter.rules() {
            args.push(format!("--filter={rule}"));
        }
        args.push(format!("{}/", local_dir.display()));
        args.push(format!("{}:{remote_dir}/", self.destination(host)));
        args
    }

    async fn run(
        &self,
        host: &str,
        mut command: Command,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, ExecError> {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ExecError::Spawn {
            host: host.to_string(),
            program: program.clone(),
            reason: e.to_string(),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await.map_err(|e| ExecError::Spawn {
                host: host.to_string(),
                program: program.clone(),
                reason: format!("writing stdin: {e}"),
            })?;
        }

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                host: host.to_string(),
                after: self.command_timeout,
            })?
            .map_err(|e| ExecError::Spawn {
                host: host.to_string(),
                program,
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ExecError::Failed {
                host: host.to_string(),
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute_command<'a>(&'a self, host: &'a str, command: &'a str) -> ExecFuture<'a> {
        Box::pin(async move {
            debug!(%host, %command, "ssh");
            let mut cmd = Command::new("ssh");
            cmd.args(self.ssh_args(host, command));
            self.run(host, cmd, None).await
        })
    }

    fn execute_file_command<'a>(&'a self, host: &'a str, script: &'a Path) -> ExecFuture<'a> {
        Box::pin(async move {
            debug!(%host, script = %script.display(), "ssh script");
            let body = tokio::fs::read(script).await.map_err(|e| ExecError::Spawn {
                host: host.to_string(),
                program: "ssh".to_string(),
                reason: format!("reading {}: {e}", script.display()),
            })?;
            let mut cmd = Command::new("ssh");
            cmd.args(self.ssh_args(host, "sh -s"));
            self.run(host, cmd, Some(body)).await
        })
    }

    fn sync_directory<'a>(
        &'a self,
        host: &'a str,
        local_dir: &'a Path,
        remote_dir: &'a str,
        filter: &'a SyncFilter,
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            debug!(%host, local = %local_dir.display(), %remote_dir, "rsync");
            let mut cmd = Command::new("rsync");
            cmd.args(self.rsync_args(host, local_dir, remote_dir, filter));
            self.run(host, cmd, None).await
        })
    }

    fn run_local<'a>(
        &'a self,
        dir: &'a Path,
        command: &'a str,
        env: &'a [(String, String)],
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            debug!(dir = %dir.display(), %command, "local command");
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).current_dir(dir);
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            self.run("localhost", cmd, None).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn executor() -> SshExecutor {
        SshExecutor::new(&SshSettings {
            user: "deploy".to_string(),
            port: 2222,
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            connect_timeout: "5s".to_string(),
            command_timeout: "2s".to_string(),
        })
    }

    #[test]
    fn ssh_args_carry_port_timeout_and_identity() {
        let args = executor().ssh_args("10.0.0.1", "uptime");
        let joined = args.join(" ");
        assert!(joined.starts_with("-p 2222 -o BatchMode=yes -o ConnectTimeout=5"));
        assert!(joined.contains("-i /keys/id_ed25519"));
        assert!(joined.ends_with("deploy@10.0.0.1 -- uptime"));
    }

    #[test]
    fn rsync_args_apply_filter_and_delete() {
        let args = executor().rsync_args(
            "10.0.0.1",
            Path::new("/state/work/10.0.0.1"),
            "/opt/hoist/",
            &SyncFilter::only(["web"]),
        );
        assert_eq!(args[0], "-a");
        assert_eq!(args[1], "--delete");
        assert!(args[3].starts_with("ssh -p 2222"));
        assert_eq!(args[4], "--rsync-path=mkdir -p /opt/hoist && rsync");
        assert!(args.contains(&"--filter=+ /jobs/web/***".to_string()));
        assert!(args.contains(&"--filter=- /jobs/*".to_string()));
        assert_eq!(args[args.len() - 2], "/state/work/10.0.0.1/");
        assert_eq!(args[args.len() - 1], "deploy@10.0.0.1:/opt/hoist/");
    }

    #[tokio::test]
    async fn run_local_uses_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = vec![("HOIST_JOB".to_string(), "web".to_string())];
        let output = executor()
            .run_local(dir.path(), "echo $HOIST_JOB > out.txt && cat out.txt", &env)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "web");
        assert!(dir.path().join("out.txt").is_file());
    }

    #[tokio::test]
    async fn run_local_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor()
            .run_local(dir.path(), "echo nope >&2; exit 3", &[])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecError::Failed {
                host: "localhost".to_string(),
                code: Some(3),
                stderr: "nope".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn run_local_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor()
            .run_local(dir.path(), "sleep 10", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }
}
