//! Typed component errors.
//!
//! Orchestration code works in `anyhow::Result`; these types survive the
//! conversion so the CLI can classify a failure with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single oracle invocation.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("oracle reply does not match `{shape}`: {message}")]
    Schema { shape: String, message: String },
    #[error("oracle refused: {0}")]
    Refused(String),
}

/// Failure of one command on an open session.
///
/// Both variants are turned into tool results by the executor; neither aborts
/// a round.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("command timed out after {}s", timeout.as_secs())]
    Timeout {
        timeout: Duration,
        /// Output captured before the command was killed.
        partial_output: String,
    },
    #[error("channel failure: {0}")]
    ChannelFailure(String),
}

#[derive(Debug, Error)]
#[error("connect to {target} failed: {message}")]
pub struct ConnError {
    pub target: String,
    pub message: String,
}

/// The planner's oracle reply parsed but did not describe a usable result.
#[derive(Debug, Error)]
#[error("planner reply for `{shape}` is malformed: {message}")]
pub struct PlannerSchemaError {
    pub shape: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Oracle(OracleError),
    #[error(transparent)]
    Schema(#[from] PlannerSchemaError),
    #[error("render planner prompt: {0}")]
    Prompt(#[from] PromptError),
}

impl From<OracleError> for PlannerError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Schema { shape, message } => {
                PlannerError::Schema(PlannerSchemaError { shape, message })
            }
            other => PlannerError::Oracle(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor oracle call failed in round {round}: {source}")]
    Oracle {
        round: usize,
        #[source]
        source: OracleError,
    },
    #[error("render executor prompt: {0}")]
    Prompt(#[from] PromptError),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("render analyzer prompt: {0}")]
    Prompt(#[from] PromptError),
}

/// Why a knowledge merge kept the previous corpus. Logged, never returned.
#[derive(Debug, Error)]
pub(crate) enum MergeFailure {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("render merge prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("merged knowledge is empty")]
    Empty,
}

#[derive(Debug, Error)]
#[error("prompt `{template}`: {message}")]
pub struct PromptError {
    pub template: String,
    pub message: String,
}
