//! Knowledge aggregator: folds new facts into the running corpus.
//!
//! Merging is best effort. Any failure keeps the previous corpus verbatim and
//! is logged, so a bad merge never ends a run.

use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::AgentContext;
use crate::core::shape::{OutputShape, StructuredSchema};
use crate::core::transcript::Message;
use crate::core::types::KnowledgeCorpus;
use crate::error::MergeFailure;
use crate::io::telemetry::{TelemetryEvent, UPDATE_KNOWLEDGE, UPDATE_KNOWLEDGE_FAILED};

#[derive(Debug, Deserialize)]
struct KnowledgeMerge {
    knowledge: String,
}

pub struct KnowledgeAggregator {
    ctx: AgentContext,
}

impl KnowledgeAggregator {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Merge `facts` and `vulnerabilities` into `existing`.
    ///
    /// Returns `existing` unchanged when there is nothing new or the merge fails.
    #[instrument(skip_all, fields(facts = facts.len(), vulnerabilities = vulnerabilities.len()))]
    pub async fn merge(
        &self,
        existing: KnowledgeCorpus,
        facts: &[String],
        vulnerabilities: &[String],
    ) -> KnowledgeCorpus {
        if facts.is_empty() && vulnerabilities.is_empty() {
            return existing;
        }
        match self.try_merge(&existing, facts, vulnerabilities).await {
            Ok(merged) => merged,
            Err(err) => {
                warn!(err = %err, "knowledge merge failed, keeping previous corpus");
                self.ctx.telemetry.record(TelemetryEvent::new(
                    UPDATE_KNOWLEDGE_FAILED,
                    json!({
                        "error": err.to_string(),
                        "facts": facts,
                        "vulnerabilities": vulnerabilities,
                    }),
                ));
                existing
            }
        }
    }

    async fn try_merge(
        &self,
        existing: &KnowledgeCorpus,
        facts: &[String],
        vulnerabilities: &[String],
    ) -> Result<KnowledgeCorpus, MergeFailure> {
        let prompt = self
            .ctx
            .prompts
            .knowledge_merge(existing, facts, vulnerabilities)?;
        let schema = StructuredSchema::KNOWLEDGE_MERGE;
        let timed = self
            .ctx
            .invoke(&[Message::user(prompt)], &OutputShape::Structured(schema))
            .await?;
        let merged: KnowledgeMerge = timed
            .reply
            .value
            .decode(&schema)
            .map_err(|err| self.ctx.rejected(UPDATE_KNOWLEDGE, &timed, err))?;
        if merged.knowledge.trim().is_empty() {
            return Err(self
                .ctx
                .rejected(UPDATE_KNOWLEDGE, &timed, MergeFailure::Empty));
        }
        self.ctx.record(
            UPDATE_KNOWLEDGE,
            json!({
                "facts": facts,
                "vulnerabilities": vulnerabilities,
                "knowledge": merged.knowledge,
            }),
            &timed,
        );
        info!(bytes = merged.knowledge.len(), "knowledge merged");
        Ok(KnowledgeCorpus::new(merged.knowledge.trim()))
    }
}
