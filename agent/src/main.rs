//! `pentest-agent` command line.
//!
//! `run` drives the full Plan-Execute-Knowledge loop against the configured
//! target, `exec` runs a single task through the executor only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use pentest_agent::agents::{
    AgentContext, ExecutionAnalyzer, ExecutorSettings, KnowledgeAggregator, StrategyPlanner,
    TaskExecutor,
};
use pentest_agent::core::types::{KnowledgeCorpus, Plan, Task};
use pentest_agent::error::{ExecutorError, OracleError, PlannerError};
use pentest_agent::exit_codes;
use pentest_agent::io::channel::{Session, channel_from_config};
use pentest_agent::io::config::{
    AgentConfig, DEFAULT_CONFIG_PATH, load_config, secret_from_env, write_config,
};
use pentest_agent::io::oracle::{OpenAiOracle, Oracle};
use pentest_agent::io::prompt::PromptEngine;
use pentest_agent::io::state_files::{StatePaths, read_knowledge, read_plan};
use pentest_agent::io::telemetry::{JsonlTelemetry, Telemetry};
use pentest_agent::io::tool::{RemoteExecTool, Tool};
use pentest_agent::logging;
use pentest_agent::looping::{Agents, LoopConfig, LoopStop, run_loop};

#[derive(Parser)]
#[command(
    name = "pentest-agent",
    version,
    about = "Autonomous penetration-test agent (plan, execute, learn)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full loop until the planner reports the objective finished.
    Run {
        #[command(flatten)]
        common: CommonArgs,
        /// Resume from a previously persisted plan.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Start from a previously persisted knowledge corpus.
        #[arg(long)]
        knowledge: Option<PathBuf>,
    },
    /// Run a single task through the executor and print its summary.
    Exec {
        #[command(flatten)]
        common: CommonArgs,
        /// Instruction for the executor.
        #[arg(long)]
        task: String,
        /// Extra context for the task.
        #[arg(long, default_value = "")]
        context: String,
    },
    /// Manage the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
struct CommonArgs {
    /// Markdown file describing the engagement scope and objective.
    #[arg(long)]
    scenario: PathBuf,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
    /// Parse and validate a config file.
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            classify(&err)
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            common,
            plan,
            knowledge,
        } => block_on(cmd_run(common, plan, knowledge)),
        Command::Exec {
            common,
            task,
            context,
        } => block_on(cmd_exec(common, Task::new(task, context))),
        Command::Config(ConfigCommand::Init { force, path }) => cmd_config_init(&path, force),
        Command::Config(ConfigCommand::Validate { path }) => cmd_config_validate(&path),
    }
}

fn block_on<F: std::future::Future<Output = Result<i32>>>(fut: F) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    runtime.block_on(fut)
}

/// Oracle-backed failures during a run are `FAILED`; anything else is setup.
fn classify(err: &anyhow::Error) -> i32 {
    let oracle_failure = err.chain().any(|cause| {
        cause.is::<PlannerError>() || cause.is::<ExecutorError>() || cause.is::<OracleError>()
    });
    if oracle_failure {
        exit_codes::FAILED
    } else {
        exit_codes::INVALID
    }
}

async fn cmd_run(
    common: CommonArgs,
    plan_path: Option<PathBuf>,
    knowledge_path: Option<PathBuf>,
) -> Result<i32> {
    let setup = Setup::new(&common).await?;
    let plan = match plan_path {
        Some(path) => read_plan(&path)?,
        None => Plan::empty(),
    };
    let knowledge = match knowledge_path {
        Some(path) => read_knowledge(&path)?,
        None => KnowledgeCorpus::default(),
    };

    let agents = Agents {
        planner: StrategyPlanner::new(setup.planner_ctx.clone()),
        executor: setup.executor(),
        analyzer: ExecutionAnalyzer::new(setup.planner_ctx.clone()),
        aggregator: KnowledgeAggregator::new(setup.planner_ctx.clone()),
    };
    let loop_config = LoopConfig {
        max_iterations: setup.config.controller.max_iterations,
        planner_retries: setup.config.controller.planner_retries,
        state: Some(StatePaths::new(&setup.config.telemetry.log_dir)),
    };

    let outcome = run_loop(
        &agents,
        &setup.telemetry,
        &loop_config,
        plan,
        knowledge,
        |report| {
            println!(
                "[{}] {} ({} commands)",
                report.iteration,
                report.task.next_step,
                report.outcome.executed().cmd_history.len()
            );
        },
    )
    .await?;

    match outcome.stop {
        LoopStop::Finished { response } => {
            println!("{response}");
            Ok(exit_codes::OK)
        }
        LoopStop::MaxIterationsExceeded { max_iterations } => {
            eprintln!("stopped after {max_iterations} tasks without finishing");
            Ok(exit_codes::INCOMPLETE)
        }
    }
}

async fn cmd_exec(common: CommonArgs, task: Task) -> Result<i32> {
    let setup = Setup::new(&common).await?;
    let executed = setup
        .executor()
        .run(Arc::new(task), &KnowledgeCorpus::default(), &[])
        .await
        .context("execute task")?;
    println!("{}", executed.summary);
    Ok(exit_codes::OK)
}

fn cmd_config_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    write_config(path, &AgentConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_config_validate(path: &Path) -> Result<i32> {
    if !path.exists() {
        return Err(anyhow!("{} not found", path.display()));
    }
    load_config(path)?;
    Ok(exit_codes::OK)
}

/// Everything a run needs, built once and shared by the agents.
struct Setup {
    config: AgentConfig,
    planner_ctx: AgentContext,
    executor_oracle: Arc<dyn Oracle>,
    session: Arc<dyn Session>,
    telemetry: Arc<dyn Telemetry>,
}

impl Setup {
    async fn new(common: &CommonArgs) -> Result<Self> {
        let config = load_config(&common.config)?;
        let scenario = fs::read_to_string(&common.scenario)
            .with_context(|| format!("read scenario {}", common.scenario.display()))?;
        if scenario.trim().is_empty() {
            return Err(anyhow!("scenario {} is empty", common.scenario.display()));
        }

        let api_key = secret_from_env(&config.oracle.api_key_env)
            .with_context(|| format!("{} is not set", config.oracle.api_key_env))?;
        let oracle = |model: &str| -> Result<Arc<dyn Oracle>> {
            let oracle = OpenAiOracle::new(
                &config.oracle.base_url,
                api_key.clone(),
                model,
                std::time::Duration::from_secs(config.oracle.request_timeout_secs),
            )?
            .with_temperature(config.oracle.temperature);
            Ok(Arc::new(oracle))
        };
        let planner_oracle = oracle(config.oracle.planner_model.as_str())?;
        let executor_oracle = oracle(config.oracle.executor_model.as_str())?;

        let channel = channel_from_config(&config.channel, &config.executor);
        info!(host = %channel.describe(), "connecting");
        let session = channel.connect().await.context("connect to target")?;

        let jsonl = JsonlTelemetry::create(&config.telemetry.log_dir)?;
        eprintln!("telemetry: {}", jsonl.path().display());
        let telemetry: Arc<dyn Telemetry> = Arc::new(jsonl);

        let planner_ctx = AgentContext {
            oracle: planner_oracle,
            telemetry: telemetry.clone(),
            prompts: Arc::new(PromptEngine::new(config.controller.prompt_budget_bytes)),
            scenario: Arc::from(scenario.trim()),
        };
        Ok(Self {
            config,
            planner_ctx,
            executor_oracle,
            session,
            telemetry,
        })
    }

    fn executor(&self) -> TaskExecutor {
        let tool: Arc<dyn Tool> = Arc::new(RemoteExecTool::new(
            self.session.clone(),
            self.config.executor.command_timeout(),
        ));
        TaskExecutor::new(
            self.planner_ctx.with_oracle(self.executor_oracle.clone()),
            vec![tool],
            ExecutorSettings::from(&self.config.executor),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_resume() {
        let cli = Cli::parse_from([
            "pentest-agent",
            "run",
            "--scenario",
            "scenario.md",
            "--plan",
            "logs/plan.md",
        ]);
        match cli.command {
            Command::Run {
                common,
                plan,
                knowledge,
            } => {
                assert_eq!(common.scenario, PathBuf::from("scenario.md"));
                assert_eq!(common.config, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert_eq!(plan, Some(PathBuf::from("logs/plan.md")));
                assert!(knowledge.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_exec_requires_task() {
        let parsed = Cli::try_parse_from(["pentest-agent", "exec", "--scenario", "s.md"]);
        assert!(parsed.is_err());

        let cli = Cli::parse_from([
            "pentest-agent",
            "exec",
            "--scenario",
            "s.md",
            "--task",
            "list open ports",
        ]);
        assert!(matches!(cli.command, Command::Exec { ref task, .. } if task == "list open ports"));
    }

    #[test]
    fn parse_config_init_force() {
        let cli = Cli::parse_from(["pentest-agent", "config", "init", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Init { force: true, .. })
        ));
    }

    #[test]
    fn oracle_failures_classify_as_failed() {
        let err = anyhow!(PlannerError::Oracle(OracleError::Transport("reset".to_string())))
            .context("update plan");
        assert_eq!(classify(&err), exit_codes::FAILED);

        let err = anyhow!("scenario is empty");
        assert_eq!(classify(&err), exit_codes::INVALID);
    }
}
