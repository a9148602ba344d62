//! Remote command execution channels.
//!
//! A [`Channel`] opens one [`Session`] per run. Sessions are shared across
//! concurrently dispatched commands, so `execute` takes `&self` and must be
//! safe to call from several tasks at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnError, ExecError};
use crate::io::config::{ChannelConfig, ChannelKind, ExecutorConfig, secret_from_env};

pub mod local;
pub mod ssh;

pub use local::LocalChannel;
pub use ssh::SshChannel;

/// Output of a command that ran to completion (any exit status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Stdout and stderr, merged.
    pub output: String,
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Session>, ConnError>;

    /// Human-readable target, e.g. `root@10.0.0.5:22`.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError>;
}

/// Build the channel selected by `[channel]`.
pub fn channel_from_config(channel: &ChannelConfig, executor: &ExecutorConfig) -> Box<dyn Channel> {
    match channel.kind {
        ChannelKind::Local => Box::new(LocalChannel::new(executor.output_limit_bytes)),
        ChannelKind::Ssh => Box::new(SshChannel::new(
            ssh::SshTarget {
                host: channel.host.clone(),
                port: channel.port,
                username: channel.username.clone(),
                password: secret_from_env(&channel.password_env),
                identity_file: channel.identity_file.clone(),
            },
            Duration::from_secs(channel.connect_timeout_secs),
            executor.output_limit_bytes,
        )),
    }
}

/// Run a blocking process call on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, ExecError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ExecError::ChannelFailure(format!("{err:#}"))),
        Err(err) => Err(ExecError::ChannelFailure(format!(
            "command worker failed: {err}"
        ))),
    }
}
