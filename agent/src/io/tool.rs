//! Capabilities the executor's oracle may call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::shape::ToolSpec;
use crate::error::ExecError;
use crate::io::channel::Session;

pub const EXECUTE_COMMAND: &str = "execute_command";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl ToolError {
    /// Text recorded as the invocation's result in place of output.
    pub fn to_result_text(&self) -> String {
        match self {
            ToolError::InvalidArguments(message) => format!("Invalid tool arguments: {message}"),
            ToolError::Exec(ExecError::Timeout {
                timeout,
                partial_output,
            }) => {
                let notice = format!(
                    "Timeout during command execution (after {}s)",
                    timeout.as_secs()
                );
                if partial_output.trim().is_empty() {
                    notice
                } else {
                    format!("{}\n[{notice}]", partial_output.trim_end())
                }
            }
            ToolError::Exec(ExecError::ChannelFailure(message)) => {
                format!("Command execution failed: {message}")
            }
        }
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    /// Exit status, for tools backed by a process.
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Rendering of a call for the command history.
    fn describe_call(&self, args: &Value) -> String {
        args.to_string()
    }

    async fn invoke(&self, args: &Value) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, Deserialize)]
struct ExecuteCommandArgs {
    command: String,
}

/// Runs one shell command on the shared remote session.
pub struct RemoteExecTool {
    session: Arc<dyn Session>,
    timeout: Duration,
}

impl RemoteExecTool {
    pub fn new(session: Arc<dyn Session>, timeout: Duration) -> Self {
        Self { session, timeout }
    }
}

#[async_trait]
impl Tool for RemoteExecTool {
    fn name(&self) -> &str {
        EXECUTE_COMMAND
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: EXECUTE_COMMAND.to_string(),
            description: format!(
                "Execute a shell command on the attacker host and return its combined output. \
                 Commands are killed after {} seconds; do not start interactive programs.",
                self.timeout.as_secs()
            ),
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["command"],
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute."
                    }
                }
            }),
        }
    }

    fn describe_call(&self, args: &Value) -> String {
        match args.get("command").and_then(Value::as_str) {
            Some(command) => command.to_string(),
            None => args.to_string(),
        }
    }

    async fn invoke(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        let args: ExecuteCommandArgs = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::InvalidArguments(err.to_string()))?;
        if args.command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("command is empty".to_string()));
        }
        let output = self.session.execute(&args.command, self.timeout).await?;
        Ok(ToolOutput {
            text: output.output,
            exit_code: output.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedSession;

    #[tokio::test]
    async fn runs_command_on_session() {
        let session = Arc::new(ScriptedSession::new().reply("id", "uid=0(root)\n"));
        let tool = RemoteExecTool::new(session.clone(), Duration::from_secs(5));
        let output = tool.invoke(&json!({"command": "id"})).await.expect("invoke");
        assert_eq!(output.text, "uid=0(root)\n");
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(session.executed(), vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn rejects_missing_command() {
        let session = Arc::new(ScriptedSession::new());
        let tool = RemoteExecTool::new(session, Duration::from_secs(5));
        let err = tool.invoke(&json!({"cmd": "id"})).await.expect_err("invalid");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(err.to_result_text().starts_with("Invalid tool arguments"));
    }

    #[test]
    fn timeout_text_keeps_partial_output() {
        let err = ToolError::Exec(ExecError::Timeout {
            timeout: Duration::from_secs(300),
            partial_output: "Starting Nmap\n".to_string(),
        });
        assert_eq!(
            err.to_result_text(),
            "Starting Nmap\n[Timeout during command execution (after 300s)]"
        );
        let empty = ToolError::Exec(ExecError::Timeout {
            timeout: Duration::from_secs(5),
            partial_output: String::new(),
        });
        assert_eq!(
            empty.to_result_text(),
            "Timeout during command execution (after 5s)"
        );
    }

    #[test]
    fn describe_call_prefers_command_text() {
        let session = Arc::new(ScriptedSession::new());
        let tool = RemoteExecTool::new(session, Duration::from_secs(5));
        assert_eq!(tool.describe_call(&json!({"command": "ls -la"})), "ls -la");
        assert_eq!(tool.describe_call(&json!("raw")), "\"raw\"");
    }
}
