//! SSH channel over the system OpenSSH client.
//!
//! `connect` starts a control master in a private directory; every command
//! then runs as a multiplexed client over that one authenticated connection,
//! which lets a round dispatch several commands at once.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use super::local::finish;
use super::{Channel, ExecOutput, Session, run_blocking};
use crate::error::{ConnError, ExecError};
use crate::io::process::run_command_with_timeout;

/// OpenSSH reserves this exit status for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password for `sshpass`; `None` means key or agent auth.
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Options shared by the master and every client.
    fn common_args(&self, control_path: &Path, connect_timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        ];
        if self.password.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        if let Some(identity) = &self.identity_file {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }
        args
    }
}

pub struct SshChannel {
    target: SshTarget,
    connect_timeout: Duration,
    output_limit_bytes: usize,
}

impl SshChannel {
    pub fn new(target: SshTarget, connect_timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            target,
            connect_timeout,
            output_limit_bytes,
        }
    }

    fn conn_error(&self, message: impl Into<String>) -> ConnError {
        ConnError {
            target: self.describe(),
            message: message.into(),
        }
    }
}

fn master_command(target: &SshTarget, control_path: &Path, connect_timeout: Duration) -> Command {
    let mut cmd = match &target.password {
        Some(password) => {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e").arg("ssh").env("SSHPASS", password);
            cmd
        }
        None => Command::new("ssh"),
    };
    cmd.args(["-M", "-N", "-f"])
        .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
        .args(target.common_args(control_path, connect_timeout))
        .arg(target.destination());
    cmd
}

fn client_command(target: &SshTarget, control_path: &Path, connect_timeout: Duration) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "ControlMaster=no"])
        .args(target.common_args(control_path, connect_timeout))
        .arg(target.destination());
    cmd
}

/// Start the master and wait for it to background itself.
///
/// The backgrounded master keeps any inherited pipes open, so its output is
/// discarded instead of captured.
fn start_master(target: &SshTarget, control_path: &Path, connect_timeout: Duration) -> Result<()> {
    let mut cmd = master_command(target, control_path, connect_timeout);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().context("spawn ssh control master")?;
    let grace = connect_timeout + Duration::from_secs(5);
    let status = match child.wait_timeout(grace).context("wait for ssh master")? {
        Some(status) => status,
        None => {
            child.kill().context("kill ssh master")?;
            child.wait().context("wait ssh master after kill")?;
            bail!("ssh master did not authenticate within {}s", grace.as_secs());
        }
    };
    if !status.success() {
        bail!("ssh master exited with {status}");
    }

    let mut check = client_command(target, control_path, connect_timeout);
    check.args(["-O", "check"]);
    let output = run_command_with_timeout(check, connect_timeout, 4096)?;
    if !output.status.success() {
        bail!("control master not running: {}", output.merged().trim());
    }
    Ok(())
}

#[async_trait]
impl Channel for SshChannel {
    #[instrument(skip_all, fields(target = %self.describe()))]
    async fn connect(&self) -> Result<Arc<dyn Session>, ConnError> {
        let control_dir = tempfile::Builder::new()
            .prefix("pentest-agent-ssh")
            .tempdir()
            .map_err(|err| self.conn_error(format!("create control dir: {err}")))?;
        let control_path = control_dir.path().join("master");

        let target = self.target.clone();
        let path = control_path.clone();
        let timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || start_master(&target, &path, timeout))
            .await
            .map_err(|err| self.conn_error(format!("connect worker failed: {err}")))?
            .map_err(|err| self.conn_error(format!("{err:#}")))?;

        info!("ssh control master started");
        Ok(Arc::new(SshSession {
            target: self.target.clone(),
            control_path,
            connect_timeout: self.connect_timeout,
            output_limit_bytes: self.output_limit_bytes,
            _control_dir: control_dir,
        }))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.target.destination(), self.target.port)
    }
}

pub struct SshSession {
    target: SshTarget,
    control_path: PathBuf,
    connect_timeout: Duration,
    output_limit_bytes: usize,
    _control_dir: TempDir,
}

#[async_trait]
impl Session for SshSession {
    #[instrument(skip_all, fields(command = %command, timeout_secs = timeout.as_secs()))]
    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        let mut cmd = client_command(&self.target, &self.control_path, self.connect_timeout);
        cmd.arg("--").arg(command);
        let limit = self.output_limit_bytes;
        let output = run_blocking(move || run_command_with_timeout(cmd, timeout, limit)).await?;
        if !output.timed_out && output.status.code() == Some(SSH_ERROR_EXIT) {
            let detail = output.merged();
            debug!(output = %detail.trim(), "ssh client failed");
            return Err(ExecError::ChannelFailure(format!(
                "ssh exited with {SSH_ERROR_EXIT}: {}",
                detail.trim()
            )));
        }
        finish(output, timeout)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let mut cmd = client_command(&self.target, &self.control_path, self.connect_timeout);
        cmd.args(["-O", "exit"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(err) = cmd.status() {
            warn!(err = %err, "failed to stop ssh control master");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(password: Option<&str>) -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 2222,
            username: "kali".to_string(),
            password: password.map(str::to_string),
            identity_file: None,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn password_goes_through_env_not_argv() {
        let cmd = master_command(
            &target(Some("s3cret")),
            Path::new("/tmp/cm"),
            Duration::from_secs(30),
        );
        assert_eq!(cmd.get_program(), "sshpass");
        let argv = args(&cmd);
        assert!(argv.iter().all(|arg| !arg.contains("s3cret")));
        assert!(
            cmd.get_envs()
                .any(|(key, value)| key == "SSHPASS" && value.is_some())
        );
        assert!(argv.contains(&"ControlMaster=yes".to_string()));
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn client_reuses_control_path() {
        let cmd = client_command(&target(None), Path::new("/tmp/cm"), Duration::from_secs(30));
        let argv = args(&cmd);
        assert_eq!(cmd.get_program(), "ssh");
        assert!(argv.contains(&"ControlPath=/tmp/cm".to_string()));
        assert!(argv.contains(&"ControlMaster=no".to_string()));
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("kali@10.0.0.5"));
    }

    #[test]
    fn describe_names_user_host_and_port() {
        let channel = SshChannel::new(target(None), Duration::from_secs(1), 1024);
        assert_eq!(channel.describe(), "kali@10.0.0.5:2222");
    }
}
