//! Controller loop for `pentest-agent run`.
//!
//! One task at a time: update plan, select, execute, analyze, merge
//! knowledge, repeat until the planner reports the objective finished.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::agents::{ExecutionAnalyzer, KnowledgeAggregator, StrategyPlanner, TaskExecutor};
use crate::core::history::remember_invalid_commands;
use crate::core::types::{
    InvalidCommand, KnowledgeCorpus, Plan, PlanResult, Task, TaskOutcome,
};
use crate::error::PlannerError;
use crate::io::state_files::{StatePaths, write_state};
use crate::io::telemetry::{
    RUN_FAILED, RUN_FINISHED, RUN_STARTED, Telemetry, TelemetryEvent,
};

/// The four agents a run is made of.
pub struct Agents {
    pub planner: StrategyPlanner,
    pub executor: TaskExecutor,
    pub analyzer: ExecutionAnalyzer,
    pub aggregator: KnowledgeAggregator,
}

#[derive(Debug, Clone, Default)]
pub struct LoopConfig {
    /// Executed tasks before stopping; 0 means unlimited.
    pub max_iterations: u32,
    /// Extra attempts for a failed planner call.
    pub planner_retries: u32,
    /// Where `plan.md` and `knowledge.md` are rewritten after every change.
    pub state: Option<StatePaths>,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The planner declared the objective finished.
    Finished { response: String },
    /// The run executed `max_iterations` tasks without finishing.
    MaxIterationsExceeded { max_iterations: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub stop: LoopStop,
    pub plan: Plan,
    pub knowledge: KnowledgeCorpus,
}

/// Progress report passed to the `on_iteration` callback.
#[derive(Debug)]
pub struct IterationReport<'a> {
    pub iteration: u32,
    pub task: &'a Task,
    pub outcome: &'a TaskOutcome,
    pub knowledge: &'a KnowledgeCorpus,
}

/// Run the Plan-Execute-Knowledge loop from `plan` and `knowledge`.
///
/// Planner calls are retried `planner_retries` times; any other oracle
/// failure stops the run with the typed error preserved for `downcast_ref`.
/// A failed analysis or knowledge merge only degrades the iteration.
#[instrument(skip_all, fields(max_iterations = config.max_iterations))]
pub async fn run_loop<F: FnMut(&IterationReport<'_>)>(
    agents: &Agents,
    telemetry: &Arc<dyn Telemetry>,
    config: &LoopConfig,
    plan: Plan,
    knowledge: KnowledgeCorpus,
    on_iteration: F,
) -> Result<LoopOutcome> {
    telemetry.record(TelemetryEvent::new(
        RUN_STARTED,
        json!({
            "max_iterations": config.max_iterations,
            "resumed_plan": !plan.is_empty(),
            "resumed_knowledge": !knowledge.is_empty(),
            "knowledge_bytes": knowledge.as_str().len(),
        }),
    ));
    let result = drive(agents, config, plan, knowledge, on_iteration).await;
    match &result {
        Ok(outcome) => telemetry.record(TelemetryEvent::new(
            RUN_FINISHED,
            json!({
                "iterations": outcome.iterations,
                "stop": format!("{:?}", outcome.stop),
            }),
        )),
        Err(err) => telemetry.record(TelemetryEvent::new(
            RUN_FAILED,
            json!({"error": format!("{err:#}")}),
        )),
    }
    result
}

async fn drive<F: FnMut(&IterationReport<'_>)>(
    agents: &Agents,
    config: &LoopConfig,
    mut plan: Plan,
    mut knowledge: KnowledgeCorpus,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let mut outcome: Option<TaskOutcome> = None;
    let mut invalid_commands: Vec<InvalidCommand> = Vec::new();
    let mut iterations = 0u32;

    loop {
        plan = with_retries("update plan", config.planner_retries, || {
            agents.planner.update_plan(outcome.as_ref(), &plan)
        })
        .await
        .context("update plan")?;
        persist(config, &plan, &knowledge)?;

        if config.max_iterations > 0 && iterations >= config.max_iterations {
            info!(iterations, "iteration limit reached");
            return Ok(LoopOutcome {
                iterations,
                stop: LoopStop::MaxIterationsExceeded {
                    max_iterations: config.max_iterations,
                },
                plan,
                knowledge,
            });
        }

        let selected = with_retries("select next task", config.planner_retries, || {
            agents.planner.select_next_task(&plan, &knowledge)
        })
        .await
        .context("select next task")?;
        let task = match selected {
            PlanResult::Finished { response } => {
                info!(iterations, "planner finished");
                return Ok(LoopOutcome {
                    iterations,
                    stop: LoopStop::Finished { response },
                    plan,
                    knowledge,
                });
            }
            PlanResult::Task(task) => Arc::new(task),
        };

        info!(iteration = iterations + 1, task = %task.next_step, "executing task");
        let executed = agents
            .executor
            .run(task.clone(), &knowledge, &invalid_commands)
            .await
            .context("execute task")?;
        iterations += 1;

        let next = match agents.analyzer.analyze(&executed).await {
            Ok(analysis) => {
                let added =
                    remember_invalid_commands(&mut invalid_commands, &analysis.invalid_commands);
                if added > 0 {
                    info!(
                        added,
                        total = invalid_commands.len(),
                        "remembered invalid commands"
                    );
                }
                knowledge = agents
                    .aggregator
                    .merge(
                        knowledge,
                        &analysis.gathered_knowledge,
                        &analysis.vulnerabilities,
                    )
                    .await;
                TaskOutcome::Analyzed { executed, analysis }
            }
            Err(err) => {
                warn!(err = %err, "analysis failed, passing raw result to planner");
                TaskOutcome::Executed(executed)
            }
        };
        persist(config, &plan, &knowledge)?;

        on_iteration(&IterationReport {
            iteration: iterations,
            task: &task,
            outcome: &next,
            knowledge: &knowledge,
        });
        outcome = Some(next);
    }
}

async fn with_retries<T, F, Fut>(
    what: &str,
    retries: u32,
    mut call: F,
) -> Result<T, PlannerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlannerError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!(what, attempt, retries, err = %err, "planner call failed, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

fn persist(config: &LoopConfig, plan: &Plan, knowledge: &KnowledgeCorpus) -> Result<()> {
    match &config.state {
        Some(paths) => {
            write_state(paths, plan, knowledge).context("persist plan and knowledge")
        }
        None => Ok(()),
    }
}
