//! Task executor: drives one task through bounded tool-calling rounds.
//!
//! Each round asks the oracle for either a final summary or a batch of tool
//! calls. A batch is dispatched concurrently and the round waits for every
//! call to finish; results are recorded in completion order. If the rounds
//! run out, or the oracle returns an empty reply, one tool-less call forces a
//! summary, so a run makes at most `max_rounds + 1` oracle calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::AgentContext;
use crate::core::shape::{OutputShape, ParsedValue};
use crate::core::transcript::{Message, ToolCall, Transcript};
use crate::core::types::{ExecutedTask, InvalidCommand, KnowledgeCorpus, Task, ToolResult};
use crate::error::{ExecutorError, OracleError};
use crate::io::config::ExecutorConfig;
use crate::io::telemetry::{
    EXECUTOR_CMD, EXECUTOR_FORCED_SUMMARY, EXECUTOR_NEXT_CMDS, EXECUTOR_SUMMARY_MISSING,
    TelemetryEvent,
};
use crate::io::tool::Tool;

/// Placeholder used when even the forced summary comes back blank.
const NO_SUMMARY: &str = "(the executor returned no summary)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Tool-calling rounds before a summary is forced. At least 1.
    pub max_rounds: usize,
    /// Command timeout advertised to the oracle.
    pub command_timeout: Duration,
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            max_rounds: cfg.max_rounds,
            command_timeout: cfg.command_timeout(),
        }
    }
}

pub struct TaskExecutor {
    ctx: AgentContext,
    tools: Vec<Arc<dyn Tool>>,
    settings: ExecutorSettings,
}

enum RoundEnd {
    Exhausted,
    EmptyReply,
}

impl TaskExecutor {
    pub fn new(ctx: AgentContext, tools: Vec<Arc<dyn Tool>>, settings: ExecutorSettings) -> Self {
        Self {
            ctx,
            tools,
            settings: ExecutorSettings {
                max_rounds: settings.max_rounds.max(1),
                ..settings
            },
        }
    }

    /// Run `task` to a summary.
    ///
    /// Failed or timed-out commands are recorded as tool results; only oracle
    /// failures abort the run.
    #[instrument(skip_all, fields(task = %task.next_step, max_rounds = self.settings.max_rounds))]
    pub async fn run(
        &self,
        task: Arc<Task>,
        knowledge: &KnowledgeCorpus,
        invalid_commands: &[InvalidCommand],
    ) -> Result<ExecutedTask, ExecutorError> {
        let prompts = &self.ctx.prompts;
        let mut transcript = Transcript::new();
        transcript.push(Message::system(prompts.executor_system(
            &self.ctx.scenario,
            self.settings.command_timeout.as_secs(),
        )?));
        transcript.push(Message::user(prompts.executor_task(
            &task,
            knowledge,
            invalid_commands,
        )?));

        let shape = OutputShape::Tools(self.tools.iter().map(|tool| tool.spec()).collect());
        let mut history: Vec<ToolResult> = Vec::new();
        let mut end = RoundEnd::Exhausted;

        for round in 1..=self.settings.max_rounds {
            let timed = self
                .ctx
                .invoke(transcript.messages(), &shape)
                .await
                .map_err(|source| ExecutorError::Oracle { round, source })?;
            let (text, calls) = match timed.reply.value.clone() {
                ParsedValue::ToolCalls { text, calls } => (text, calls),
                ParsedValue::Text(text) => (text, Vec::new()),
                ParsedValue::Structured(_) => {
                    let source = OracleError::Schema {
                        shape: shape.label().to_string(),
                        message: "structured reply to a tool-bound request".to_string(),
                    };
                    let source = self.ctx.rejected(EXECUTOR_NEXT_CMDS, &timed, source);
                    return Err(ExecutorError::Oracle { round, source });
                }
            };
            debug!(
                round,
                transcript_messages = transcript.len(),
                transcript_bytes = transcript.content_bytes(),
                "executor round"
            );

            if calls.is_empty() {
                if text.trim().is_empty() {
                    warn!(round, "executor reply has neither commands nor summary");
                    self.ctx
                        .record(EXECUTOR_SUMMARY_MISSING, json!({"round": round}), &timed);
                    end = RoundEnd::EmptyReply;
                    break;
                }
                self.ctx.record(
                    EXECUTOR_NEXT_CMDS,
                    json!({"round": round, "cmds": [], "summary": text}),
                    &timed,
                );
                info!(round, commands = history.len(), "task finished");
                return Ok(ExecutedTask {
                    task,
                    summary: text.trim().to_string(),
                    cmd_history: history,
                });
            }

            let described: Vec<String> = calls.iter().map(|call| self.describe(call)).collect();
            self.ctx.record(
                EXECUTOR_NEXT_CMDS,
                json!({"round": round, "cmds": described, "content": text}),
                &timed,
            );
            debug!(round, batch = calls.len(), "dispatching commands");

            transcript.push(Message::assistant(text, calls.clone()));
            for (call_id, result) in self.dispatch(round, &calls).await {
                transcript.push(Message::tool(call_id, result.result.clone()));
                history.push(result);
            }
        }

        let exhausted = matches!(end, RoundEnd::Exhausted);
        transcript.push(Message::user(prompts.executor_forced_summary(
            &task,
            self.settings.max_rounds,
            exhausted,
        )?));
        let round = self.settings.max_rounds + 1;
        let timed = self
            .ctx
            .invoke(transcript.messages(), &OutputShape::Text)
            .await
            .map_err(|source| ExecutorError::Oracle { round, source })?;
        let mut summary = timed.reply.value.clone().into_text().trim().to_string();
        if summary.is_empty() {
            warn!("forced summary is empty");
            summary = NO_SUMMARY.to_string();
        }
        self.ctx.record(
            EXECUTOR_FORCED_SUMMARY,
            json!({"exhausted": exhausted, "summary": summary}),
            &timed,
        );
        info!(commands = history.len(), exhausted, "task summary forced");
        Ok(ExecutedTask {
            task,
            summary,
            cmd_history: history,
        })
    }

    fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    fn describe(&self, call: &ToolCall) -> String {
        match self.tool(&call.name) {
            Some(tool) => tool.describe_call(&call.arguments),
            None => call.arguments.to_string(),
        }
    }

    /// Run every call of one round concurrently; results come back in
    /// completion order, paired with their call ids.
    async fn dispatch(&self, round: usize, calls: &[ToolCall]) -> Vec<(String, ToolResult)> {
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .map(|call| self.invoke_tool(round, call))
            .collect();
        let mut done = Vec::with_capacity(calls.len());
        while let Some(result) = pending.next().await {
            done.push(result);
        }
        done
    }

    async fn invoke_tool(&self, round: usize, call: &ToolCall) -> (String, ToolResult) {
        let started = Instant::now();
        let cmd = self.describe(call);
        let (result, exit_code) = match self.tool(&call.name) {
            Some(tool) => match tool.invoke(&call.arguments).await {
                Ok(output) => (output.text, output.exit_code),
                Err(err) => {
                    warn!(round, cmd = %cmd, err = %err, "command failed");
                    (err.to_result_text(), None)
                }
            },
            None => {
                warn!(round, tool = %call.name, "oracle called an unknown tool");
                (format!("unknown tool `{}`", call.name), None)
            }
        };
        self.ctx.telemetry.record(
            TelemetryEvent::new(
                EXECUTOR_CMD,
                json!({
                    "round": round,
                    "tool": call.name,
                    "cmd": cmd,
                    "exit_code": exit_code,
                    "result": result,
                }),
            )
            .with_duration(started.elapsed().as_secs_f64()),
        );
        (
            call.id.clone(),
            ToolResult {
                tool: call.name.clone(),
                cmd,
                finished: true,
                result,
            },
        )
    }
}
