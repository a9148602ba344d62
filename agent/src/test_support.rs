//! Scripted fakes for the oracle, the remote session and telemetry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agents::AgentContext;
use crate::core::shape::{OutputShape, ParsedValue};
use crate::core::transcript::{Message, ToolCall};
use crate::core::types::Task;
use crate::error::{ExecError, OracleError};
use crate::io::channel::{ExecOutput, Session};
use crate::io::oracle::{Oracle, OracleReply};
use crate::io::prompt::PromptEngine;
use crate::io::telemetry::{Telemetry, TelemetryEvent};

/// One recorded oracle invocation.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub messages: Vec<Message>,
    pub shape: OutputShape,
}

type Responder =
    Box<dyn Fn(&[Message], &OutputShape) -> Result<ParsedValue, OracleError> + Send + Sync>;

/// Oracle that replays queued replies, then falls back to a responder.
///
/// With neither left it fails with a transport error, so a test that makes
/// more calls than scripted fails loudly.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<ParsedValue, OracleError>>>,
    fallback: Option<Responder>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: ParsedValue) -> Self {
        self.lock_replies().push_back(Ok(reply));
        self
    }

    pub fn then_err(self, err: OracleError) -> Self {
        self.lock_replies().push_back(Err(err));
        self
    }

    /// Answer every request beyond the queue with `responder`.
    pub fn otherwise<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[Message], &OutputShape) -> Result<ParsedValue, OracleError> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(responder));
        self
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    fn lock_replies(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<Result<ParsedValue, OracleError>>> {
        self.replies.lock().expect("replies lock")
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn invoke(
        &self,
        messages: &[Message],
        shape: &OutputShape,
    ) -> Result<OracleReply, OracleError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(OracleRequest {
                messages: messages.to_vec(),
                shape: shape.clone(),
            });
        let queued = self.lock_replies().pop_front();
        let reply = match (queued, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(messages, shape),
            (None, None) => Err(OracleError::Transport(
                "scripted oracle has no reply left".to_string(),
            )),
        };
        reply.map(OracleReply::new)
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

static CALL_IDS: AtomicUsize = AtomicUsize::new(0);

/// A tool-call reply requesting each command through `execute_command`.
pub fn commands(cmds: &[&str]) -> ParsedValue {
    ParsedValue::ToolCalls {
        text: String::new(),
        calls: cmds
            .iter()
            .map(|cmd| ToolCall {
                id: format!("call-{}", CALL_IDS.fetch_add(1, Ordering::Relaxed)),
                name: "execute_command".to_string(),
                arguments: json!({"command": cmd}),
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
struct ScriptedCommand {
    result: Result<String, ExecError>,
    latency: Duration,
}

/// Session that answers commands from a script, with optional latency.
///
/// Unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    script: HashMap<String, ScriptedCommand>,
    executed: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, command: &str, output: &str) -> Self {
        self.reply_after(command, output, Duration::ZERO)
    }

    pub fn reply_after(mut self, command: &str, output: &str, latency: Duration) -> Self {
        self.script.insert(
            command.to_string(),
            ScriptedCommand {
                result: Ok(output.to_string()),
                latency,
            },
        );
        self
    }

    pub fn fail(mut self, command: &str, err: ExecError) -> Self {
        self.script.insert(
            command.to_string(),
            ScriptedCommand {
                result: Err(err),
                latency: Duration::ZERO,
            },
        );
        self
    }

    /// Commands in the order they were started.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }

    /// Commands in the order they finished.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().expect("completed lock").clone()
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, ExecError> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(command.to_string());
        let scripted = self.script.get(command).cloned();
        if let Some(latency) = scripted.as_ref().map(|s| s.latency)
            && !latency.is_zero()
        {
            tokio::time::sleep(latency).await;
        }
        self.completed
            .lock()
            .expect("completed lock")
            .push(command.to_string());
        match scripted {
            Some(ScriptedCommand { result, .. }) => result.map(|output| ExecOutput {
                output,
                exit_code: Some(0),
            }),
            None => Ok(ExecOutput {
                output: String::new(),
                exit_code: Some(0),
            }),
        }
    }
}

/// Telemetry sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event).collect()
    }
}

impl Telemetry for MemoryTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

/// Agent context over the given fakes with a generous prompt budget.
pub fn agent_context(oracle: Arc<dyn Oracle>, telemetry: Arc<dyn Telemetry>) -> AgentContext {
    AgentContext {
        oracle,
        telemetry,
        prompts: Arc::new(PromptEngine::new(100_000)),
        scenario: Arc::from("Assess the lab network 10.0.0.0/24 and become domain admin."),
    }
}

pub fn task(next_step: &str) -> Arc<Task> {
    Arc::new(Task::new(next_step, ""))
}
