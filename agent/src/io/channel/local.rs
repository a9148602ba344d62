//! Runs commands on the controller host through `sh -c`.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{Channel, ExecOutput, Session, run_blocking};
use crate::error::{ConnError, ExecError};
use crate::io::process::{CommandOutput, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct LocalChannel {
    output_limit_bytes: usize,
}

impl LocalChannel {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn connect(&self) -> Result<Arc<dyn Session>, ConnError> {
        Ok(Arc::new(LocalSession {
            output_limit_bytes: self.output_limit_bytes,
        }))
    }

    fn describe(&self) -> String {
        "local shell".to_string()
    }
}

#[derive(Debug)]
pub struct LocalSession {
    output_limit_bytes: usize,
}

#[async_trait]
impl Session for LocalSession {
    #[instrument(skip_all, fields(command = %command, timeout_secs = timeout.as_secs()))]
    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let limit = self.output_limit_bytes;
        let output = run_blocking(move || run_command_with_timeout(cmd, timeout, limit)).await?;
        finish(output, timeout)
    }
}

/// Map a finished process to a session result.
pub(crate) fn finish(output: CommandOutput, timeout: Duration) -> Result<ExecOutput, ExecError> {
    if output.timed_out {
        return Err(ExecError::Timeout {
            timeout,
            partial_output: output.merged(),
        });
    }
    Ok(ExecOutput {
        output: output.merged(),
        exit_code: output.status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_shell_commands() {
        let session = LocalChannel::new(4096).connect().await.expect("connect");
        let output = session
            .execute("echo hi; exit 3", Duration::from_secs(5))
            .await
            .expect("execute");
        assert_eq!(output.output, "hi\n");
        assert_eq!(output.exit_code, Some(3));
    }

    /// The shell forks `sleep`, so the timeout must kill the whole process group.
    #[tokio::test]
    async fn timeout_reports_partial_output() {
        let session = LocalChannel::new(4096).connect().await.expect("connect");
        let started = std::time::Instant::now();
        let err = session
            .execute("echo started; sleep 5", Duration::from_millis(300))
            .await
            .expect_err("timeout");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "took {:?}",
            started.elapsed()
        );
        let ExecError::Timeout { partial_output, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(partial_output, "started\n");
    }
}
