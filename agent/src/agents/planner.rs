//! Strategy planner: owns the task plan and picks the next task.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::AgentContext;
use crate::core::plan::{PlanItem, orphan_items, root_items, validate_plan_text};
use crate::core::shape::{OutputShape, StructuredSchema};
use crate::core::transcript::Message;
use crate::core::types::{KnowledgeCorpus, Plan, PlanResult, TaskOutcome};
use crate::error::{PlannerError, PlannerSchemaError};
use crate::io::telemetry::{STRATEGY_NEXT_TASK, STRATEGY_UPDATE};

#[derive(Debug, Deserialize)]
struct PlanUpdate {
    plan: String,
    successful_attacks: Vec<String>,
    findings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlanSelection {
    result: PlanResult,
}

pub struct StrategyPlanner {
    ctx: AgentContext,
}

impl StrategyPlanner {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Fold the last task's outcome into `plan` and return the replacement plan.
    ///
    /// `outcome` is `None` only on the first call of a run. The current plan is
    /// never modified; a reply without a usable numbered plan is a schema error.
    #[instrument(skip_all, fields(has_outcome = outcome.is_some()))]
    pub async fn update_plan(
        &self,
        outcome: Option<&TaskOutcome>,
        plan: &Plan,
    ) -> Result<Plan, PlannerError> {
        let prompt = self
            .ctx
            .prompts
            .planner_update(&self.ctx.scenario, outcome, plan)?;
        let schema = StructuredSchema::PLAN_UPDATE;
        let timed = self
            .ctx
            .invoke(&[Message::user(prompt)], &OutputShape::Structured(schema))
            .await?;
        let update: PlanUpdate = timed
            .reply
            .value
            .decode(&schema)
            .map_err(|err| self.ctx.rejected(STRATEGY_UPDATE, &timed, err))?;

        let errors = validate_plan_text(&update.plan);
        if !errors.is_empty() {
            let err = PlannerSchemaError {
                shape: schema.name.to_string(),
                message: errors.join("; "),
            };
            return Err(self.ctx.rejected(STRATEGY_UPDATE, &timed, err).into());
        }
        let orphans = orphan_items(&update.plan);
        if !orphans.is_empty() {
            let labels: Vec<String> = orphans.iter().map(PlanItem::label).collect();
            warn!(orphans = ?labels, "plan has nested items without a parent");
        }

        self.ctx.record(
            STRATEGY_UPDATE,
            json!({
                "previous_task": outcome.map(TaskOutcome::task),
                "plan": update.plan,
                "successful_attacks": update.successful_attacks,
                "findings": update.findings,
            }),
            &timed,
        );
        info!(
            root_items = root_items(&update.plan).len(),
            findings = update.findings.len(),
            "plan updated"
        );
        Ok(Plan {
            text: update.plan.trim().to_string(),
            successful_attacks: update.successful_attacks,
            findings: update.findings,
        })
    }

    /// Choose the next task from the whole plan, or report the objective finished.
    #[instrument(skip_all)]
    pub async fn select_next_task(
        &self,
        plan: &Plan,
        knowledge: &KnowledgeCorpus,
    ) -> Result<PlanResult, PlannerError> {
        let prompt = self
            .ctx
            .prompts
            .planner_select(&self.ctx.scenario, plan, knowledge)?;
        let schema = StructuredSchema::PLAN_SELECTION;
        let timed = self
            .ctx
            .invoke(&[Message::user(prompt)], &OutputShape::Structured(schema))
            .await?;
        let selection: PlanSelection = timed
            .reply
            .value
            .decode(&schema)
            .map_err(|err| self.ctx.rejected(STRATEGY_NEXT_TASK, &timed, err))?;

        if let PlanResult::Task(task) = &selection.result
            && task.next_step.trim().is_empty()
        {
            let err = PlannerSchemaError {
                shape: schema.name.to_string(),
                message: "task has an empty next_step".to_string(),
            };
            return Err(self.ctx.rejected(STRATEGY_NEXT_TASK, &timed, err).into());
        }

        self.ctx.record(STRATEGY_NEXT_TASK, json!(selection.result), &timed);
        debug!(result = ?selection.result, "selected");
        Ok(selection.result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::shape::ParsedValue;
    use crate::core::types::{ExecutedTask, Task};
    use crate::error::OracleError;
    use crate::io::telemetry::ORACLE_REPLY_REJECTED;
    use crate::test_support::{MemoryTelemetry, ScriptedOracle, agent_context};

    type Fixture = (StrategyPlanner, Arc<ScriptedOracle>, Arc<MemoryTelemetry>);

    fn planner(oracle: ScriptedOracle) -> Fixture {
        let oracle = Arc::new(oracle);
        let telemetry = Arc::new(MemoryTelemetry::default());
        let ctx = agent_context(oracle.clone(), telemetry.clone());
        (StrategyPlanner::new(ctx), oracle, telemetry)
    }

    fn plan_reply(plan: &str) -> ParsedValue {
        ParsedValue::Structured(json!({
            "plan": plan,
            "successful_attacks": [],
            "findings": ["dc01 at 10.0.0.10"],
        }))
    }

    #[tokio::test]
    async fn first_update_builds_plan_with_root_item() {
        let (planner, oracle, telemetry) = planner(
            ScriptedOracle::new().then(plan_reply("1. Recon\n1.1. nmap -sn 10.0.0.0/24")),
        );
        let plan = planner
            .update_plan(None, &Plan::empty())
            .await
            .expect("plan");

        assert!(!root_items(&plan.text).is_empty());
        assert_eq!(plan.findings, vec!["dc01 at 10.0.0.10".to_string()]);
        let requests = oracle.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].messages[0].content().contains("generate a new plan"));
        assert_eq!(telemetry.names(), vec![STRATEGY_UPDATE.to_string()]);
    }

    #[tokio::test]
    async fn update_does_not_touch_input_plan() {
        let (planner, _, _) = planner(ScriptedOracle::new().then(plan_reply("1. New")));
        let current = Plan::from_text("1. Old");
        let outcome = TaskOutcome::Executed(ExecutedTask {
            task: Arc::new(Task::new("scan", "")),
            summary: "nothing found".to_string(),
            cmd_history: Vec::new(),
        });
        let next = planner
            .update_plan(Some(&outcome), &current)
            .await
            .expect("plan");
        assert_eq!(current.text, "1. Old");
        assert_eq!(next.text, "1. New");
    }

    #[tokio::test]
    async fn plan_without_root_item_is_schema_error() {
        let (planner, _, telemetry) =
            planner(ScriptedOracle::new().then(plan_reply("Just prose, no numbered items.")));
        let err = planner
            .update_plan(None, &Plan::empty())
            .await
            .expect_err("schema");
        assert!(matches!(err, PlannerError::Schema(_)));

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ORACLE_REPLY_REJECTED);
        assert_eq!(events[0].payload["stage"], STRATEGY_UPDATE);
        assert_eq!(events[0].payload["reply"]["value"]["plan"], "Just prose, no numbered items.");
        assert!(events[0].duration_secs.is_some());
        assert_eq!(events[0].model.as_deref(), Some("scripted"));
    }

    /// `1.1` without a trailing dot is a common model habit and must not fail the update.
    #[tokio::test]
    async fn mixed_numbering_is_accepted() {
        let (planner, _, _) = planner(
            ScriptedOracle::new().then(plan_reply("1. Recon\n1.1 Scan\n1.1.1. Finding")),
        );
        let plan = planner
            .update_plan(None, &Plan::empty())
            .await
            .expect("plan");
        assert_eq!(plan.text, "1. Recon\n1.1 Scan\n1.1.1. Finding");
    }

    #[tokio::test]
    async fn select_returns_task_variant() {
        let (planner, _, _) = planner(ScriptedOracle::new().then(ParsedValue::Structured(json!({
            "result": {
                "action": "task",
                "next_step": "enumerate shares on dc01",
                "next_step_context": "user alice / Passw0rd",
                "tags": ["T1135"]
            }
        }))));
        let result = planner
            .select_next_task(&Plan::from_text("1. Recon"), &KnowledgeCorpus::default())
            .await
            .expect("select");
        let PlanResult::Task(task) = result else {
            panic!("expected task");
        };
        assert_eq!(task.next_step, "enumerate shares on dc01");
        assert_eq!(task.tags, vec!["T1135".to_string()]);
    }

    #[tokio::test]
    async fn select_rejects_empty_task() {
        let (planner, _, _) = planner(ScriptedOracle::new().then(ParsedValue::Structured(json!({
            "result": {"action": "task", "next_step": " ", "next_step_context": "", "tags": []}
        }))));
        let err = planner
            .select_next_task(&Plan::from_text("1. Recon"), &KnowledgeCorpus::default())
            .await
            .expect_err("empty task");
        assert!(matches!(err, PlannerError::Schema(_)));
    }

    #[tokio::test]
    async fn malformed_selection_is_schema_error() {
        let reply = ParsedValue::Structured(json!({"result": {"action": "maybe"}}));
        let (planner, _, telemetry) = planner(ScriptedOracle::new().then(reply));
        let err = planner
            .select_next_task(&Plan::from_text("1. Recon"), &KnowledgeCorpus::default())
            .await
            .expect_err("malformed");
        assert!(matches!(err, PlannerError::Schema(_)));
        assert_eq!(telemetry.names(), vec![ORACLE_REPLY_REJECTED.to_string()]);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_oracle_error() {
        let (planner, _, _) = planner(
            ScriptedOracle::new()
                .then_err(OracleError::Transport("connection reset".to_string())),
        );
        let err = planner
            .update_plan(None, &Plan::empty())
            .await
            .expect_err("transport");
        assert!(matches!(err, PlannerError::Oracle(OracleError::Transport(_))));
    }
}
