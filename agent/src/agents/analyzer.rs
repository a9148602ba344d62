//! Extracts facts, vulnerabilities, leads and invalid commands from an executed task.

use serde_json::json;
use tracing::{info, instrument};

use super::AgentContext;
use crate::core::shape::{OutputShape, StructuredSchema};
use crate::core::transcript::Message;
use crate::core::types::{AnalyzedExecution, ExecutedTask};
use crate::error::AnalyzerError;
use crate::io::telemetry::ANALYZER;

pub struct ExecutionAnalyzer {
    ctx: AgentContext,
}

impl ExecutionAnalyzer {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    #[instrument(
        skip_all,
        fields(task = %executed.task.next_step, commands = executed.cmd_history.len())
    )]
    pub async fn analyze(
        &self,
        executed: &ExecutedTask,
    ) -> Result<AnalyzedExecution, AnalyzerError> {
        let prompt = self.ctx.prompts.analyzer(executed)?;
        let schema = StructuredSchema::EXECUTION_ANALYSIS;
        let timed = self
            .ctx
            .invoke(&[Message::user(prompt)], &OutputShape::Structured(schema))
            .await?;
        let analysis: AnalyzedExecution = timed
            .reply
            .value
            .decode(&schema)
            .map_err(|err| self.ctx.rejected(ANALYZER, &timed, err))?;
        self.ctx.record(ANALYZER, json!(analysis), &timed);
        info!(
            facts = analysis.gathered_knowledge.len(),
            vulnerabilities = analysis.vulnerabilities.len(),
            leads = analysis.potential_next_steps.len(),
            invalid_commands = analysis.invalid_commands.len(),
            "task analyzed"
        );
        Ok(analysis)
    }
}
