//! Shared data model for the Plan-Execute-Knowledge loop.
//!
//! These types are the contracts between the planner, the executor and the
//! knowledge aggregator. They carry no I/O and no oracle handles; every
//! component receives them as call inputs and returns fresh values.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A unit of work selected by the planner for execution.
///
/// Tasks are handed to the executor behind an `Arc`, so once issued they are
/// shared read-only between the executor and its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Imperative instruction for the executor.
    pub next_step: String,
    /// Supporting facts the executor needs (credentials, hosts, prior findings).
    pub next_step_context: String,
    /// Optional tactic/technique labels, bookkeeping only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Task {
    pub fn new(next_step: impl Into<String>, next_step_context: impl Into<String>) -> Self {
        Self {
            next_step: next_step.into(),
            next_step_context: next_step_context.into(),
            tags: Vec::new(),
        }
    }
}

/// Outcome of task selection: either more work or a final answer.
///
/// On the wire this is tagged by `action` (`"task"` or `"finished"`), which
/// makes a value with both or neither variant unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanResult {
    Task(Task),
    Finished { response: String },
}

/// The hierarchical task plan, re-emitted in full by every planner update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Hierarchically numbered plan text (`1.`, `1.1.`, `1.1.1.`).
    pub text: String,
    /// Attacks the planner recorded as successful at this update.
    #[serde(default)]
    pub successful_attacks: Vec<String>,
    /// Key findings the planner recorded at this update.
    #[serde(default)]
    pub findings: Vec<String>,
}

impl Plan {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resume from a previously persisted plan text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// One completed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Capability name the oracle asked for.
    pub tool: String,
    /// Literal command (or rendered arguments) that was dispatched.
    pub cmd: String,
    /// Always `true` once recorded; failures are described in `result`.
    pub finished: bool,
    /// Captured output, or a description of why there is none.
    pub result: String,
}

/// The executor's output for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedTask {
    pub task: Arc<Task>,
    /// Final narrative, or the forced summary after round exhaustion.
    pub summary: String,
    /// Every invocation attempt. Rounds are in order; entries within a round
    /// are in completion order.
    pub cmd_history: Vec<ToolResult>,
}

/// A command the analyzer flagged as invoked incorrectly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidCommand {
    pub command: String,
    /// Starts with the command's basename followed by `:`.
    pub problem: String,
    pub fixed_command: String,
}

/// Structured analysis of one executed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzedExecution {
    /// Facts about the target environment (hosts, accounts, credentials).
    pub gathered_knowledge: Vec<String>,
    /// Vulnerabilities observed or confirmed.
    pub vulnerabilities: Vec<String>,
    /// Leads worth following in later tasks.
    pub potential_next_steps: Vec<String>,
    pub invalid_commands: Vec<InvalidCommand>,
}

/// What the planner folds into the next plan update.
///
/// The executed task always travels with its outcome, so "no previous task"
/// and "no outcome" are the same state (`None` at the call site).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Executed(ExecutedTask),
    Analyzed {
        executed: ExecutedTask,
        analysis: AnalyzedExecution,
    },
}

impl TaskOutcome {
    pub fn executed(&self) -> &ExecutedTask {
        match self {
            TaskOutcome::Executed(executed) | TaskOutcome::Analyzed { executed, .. } => executed,
        }
    }

    pub fn analysis(&self) -> Option<&AnalyzedExecution> {
        match self {
            TaskOutcome::Executed(_) => None,
            TaskOutcome::Analyzed { analysis, .. } => Some(analysis),
        }
    }

    pub fn task(&self) -> &Task {
        &self.executed().task
    }
}

/// Accumulated facts about the target environment.
///
/// A best-effort cache produced by the oracle, not a database: merges replace
/// the whole text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeCorpus(String);

impl KnowledgeCorpus {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}
