//! Oracle-backed components of the Plan-Execute-Knowledge loop.
//!
//! Each agent owns an [`AgentContext`] with the oracle it talks to; none of
//! them keeps plan or knowledge state between calls.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::warn;

use crate::core::shape::OutputShape;
use crate::core::transcript::Message;
use crate::error::OracleError;
use crate::io::oracle::{Oracle, OracleReply};
use crate::io::prompt::PromptEngine;
use crate::io::telemetry::{ORACLE_REPLY_REJECTED, Telemetry, TelemetryEvent};

pub mod analyzer;
pub mod executor;
pub mod knowledge;
pub mod planner;

pub use analyzer::ExecutionAnalyzer;
pub use executor::{ExecutorSettings, TaskExecutor};
pub use knowledge::KnowledgeAggregator;
pub use planner::StrategyPlanner;

/// Handles shared by every agent.
#[derive(Clone)]
pub struct AgentContext {
    pub oracle: Arc<dyn Oracle>,
    pub telemetry: Arc<dyn Telemetry>,
    pub prompts: Arc<PromptEngine>,
    /// Engagement description given to the planner and executor.
    pub scenario: Arc<str>,
}

impl AgentContext {
    /// Same handles, different oracle.
    pub fn with_oracle(&self, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            ..self.clone()
        }
    }
}

/// A reply with the wall-clock time the oracle took.
pub(crate) struct TimedReply {
    pub reply: OracleReply,
    pub secs: f64,
}

impl AgentContext {
    pub(crate) async fn invoke(
        &self,
        messages: &[Message],
        shape: &OutputShape,
    ) -> Result<TimedReply, OracleError> {
        let started = Instant::now();
        let reply = self.oracle.invoke(messages, shape).await?;
        Ok(TimedReply {
            reply,
            secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Record an oracle-backed event with its model, cost and duration.
    pub(crate) fn record(&self, event: &str, payload: Value, timed: &TimedReply) {
        self.telemetry.record(
            TelemetryEvent::new(event, payload)
                .with_model(self.oracle.model())
                .with_cost(timed.reply.usage)
                .with_duration(timed.secs),
        );
    }

    /// Record a reply that `stage` could not use, then hand back the error.
    ///
    /// The call still cost tokens, so it is logged with the raw reply.
    pub(crate) fn rejected<E: Display>(&self, stage: &str, timed: &TimedReply, err: E) -> E {
        warn!(stage, err = %err, "oracle reply rejected");
        self.record(
            ORACLE_REPLY_REJECTED,
            json!({
                "stage": stage,
                "reply": timed.reply.value,
                "error": err.to_string(),
            }),
            timed,
        );
        err
    }
}
