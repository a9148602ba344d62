//! Agent configuration (`pentest-agent.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "pentest-agent.toml";

/// Agent configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults; secrets
/// never live in the file, only the names of the environment variables that
/// hold them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub oracle: OracleConfig,
    pub executor: ExecutorConfig,
    pub channel: ChannelConfig,
    pub controller: ControllerConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    /// OpenAI-compatible API root, without `/chat/completions`.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model used for planning, analysis and knowledge merges.
    pub planner_model: String,
    /// Model bound to the command tool.
    pub executor_model: String,
    pub request_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            planner_model: "o1".to_string(),
            executor_model: "gpt-4o".to_string(),
            request_timeout_secs: 120,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Tool-calling rounds before a summary is forced.
    pub max_rounds: usize,
    /// Per-command timeout on the remote session.
    pub command_timeout_secs: u64,
    /// Per-stream cap on captured command output.
    pub output_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            command_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl ExecutorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Ssh,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Environment variable holding the SSH password; unset means key auth.
    pub password_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Ssh,
            host: "192.168.56.107".to_string(),
            port: 22,
            username: "root".to_string(),
            password_env: "TARGET_PASSWORD".to_string(),
            identity_file: None,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Plan-execute iterations before giving up; 0 means unlimited.
    pub max_iterations: u32,
    /// Extra attempts for a failed planner call.
    pub planner_retries: u32,
    /// Byte budget per rendered prompt.
    pub prompt_budget_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            planner_retries: 1,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_dir: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.oracle.base_url.trim().is_empty() {
            return Err(anyhow!("oracle.base_url must be set"));
        }
        if self.oracle.planner_model.trim().is_empty()
            || self.oracle.executor_model.trim().is_empty()
        {
            return Err(anyhow!("oracle.planner_model and oracle.executor_model must be set"));
        }
        if self.oracle.request_timeout_secs == 0 {
            return Err(anyhow!("oracle.request_timeout_secs must be > 0"));
        }
        if self.executor.max_rounds == 0 {
            return Err(anyhow!("executor.max_rounds must be >= 1"));
        }
        if self.executor.command_timeout_secs == 0 {
            return Err(anyhow!("executor.command_timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.channel.kind == ChannelKind::Ssh {
            if self.channel.host.trim().is_empty() {
                return Err(anyhow!("channel.host must be set for ssh"));
            }
            if self.channel.username.trim().is_empty() {
                return Err(anyhow!("channel.username must be set for ssh"));
            }
            if self.channel.port == 0 {
                return Err(anyhow!("channel.port must be > 0"));
            }
        }
        if self.channel.connect_timeout_secs == 0 {
            return Err(anyhow!("channel.connect_timeout_secs must be > 0"));
        }
        if self.controller.prompt_budget_bytes < 1_000 {
            return Err(anyhow!("controller.prompt_budget_bytes must be >= 1000"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::state_files::write_atomic(path, &buf)
}

/// Read the secret named by `var`, treating unset and blank the same.
pub fn secret_from_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
