//! Prompt rendering for every oracle call.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order and the last remaining section is truncated. The
//! plan is never cut; a prompt that cannot fit around it is an error.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::history::{render_cmd_history, render_invalid_commands};
use crate::core::types::{ExecutedTask, InvalidCommand, KnowledgeCorpus, Plan, Task, TaskOutcome};
use crate::error::PromptError;

const TEMPLATES: [(&str, &str); 7] = [
    ("planner_update", include_str!("prompts/planner_update.md")),
    ("planner_select", include_str!("prompts/planner_select.md")),
    ("executor_system", include_str!("prompts/executor_system.md")),
    ("executor_task", include_str!("prompts/executor_task.md")),
    (
        "executor_forced_summary",
        include_str!("prompts/executor_forced_summary.md"),
    ),
    ("analyzer", include_str!("prompts/analyzer.md")),
    ("knowledge_merge", include_str!("prompts/knowledge_merge.md")),
];

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 6] = [
    "history",
    "invalid_commands",
    "leads",
    "knowledge",
    "findings",
    "summary",
];

/// Sections that are sent whole or not at all.
const NEVER_TRUNCATED: [&str; 1] = ["plan"];

const TRUNCATED: &str = "\n[truncated]";

/// Template engine wrapper around minijinja with a per-prompt byte budget.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl std::fmt::Debug for PromptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptEngine")
            .field("budget_bytes", &self.budget_bytes)
            .finish_non_exhaustive()
    }
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn planner_update(
        &self,
        scenario: &str,
        outcome: Option<&TaskOutcome>,
        plan: &Plan,
    ) -> Result<String, PromptError> {
        let executed = outcome.map(TaskOutcome::executed);
        let history = executed
            .map(|e| render_cmd_history(&e.cmd_history))
            .filter(|h| !h.is_empty());
        self.render(
            "planner_update",
            context! {
                scenario => scenario.trim(),
                plan => plan.text.trim(),
                task => executed.map(|e| e.task.as_ref()),
                summary => executed.map(|e| e.summary.trim()),
                analysis => outcome.and_then(TaskOutcome::analysis),
                history => history,
            },
        )
    }

    pub fn planner_select(
        &self,
        scenario: &str,
        plan: &Plan,
        knowledge: &KnowledgeCorpus,
    ) -> Result<String, PromptError> {
        self.render(
            "planner_select",
            context! {
                scenario => scenario.trim(),
                plan => plan.text.trim(),
                knowledge => non_empty(knowledge.as_str()),
            },
        )
    }

    pub fn executor_system(
        &self,
        scenario: &str,
        timeout_secs: u64,
    ) -> Result<String, PromptError> {
        self.render(
            "executor_system",
            context! {
                scenario => scenario.trim(),
                timeout_secs => timeout_secs,
            },
        )
    }

    pub fn executor_task(
        &self,
        task: &Task,
        knowledge: &KnowledgeCorpus,
        invalid_commands: &[InvalidCommand],
    ) -> Result<String, PromptError> {
        let invalid = render_invalid_commands(invalid_commands);
        self.render(
            "executor_task",
            context! {
                task => task,
                knowledge => non_empty(knowledge.as_str()),
                invalid_commands => non_empty(&invalid),
            },
        )
    }

    /// Closing request for a summary; `exhausted` is false when the oracle
    /// stopped early with an empty reply.
    pub fn executor_forced_summary(
        &self,
        task: &Task,
        max_rounds: usize,
        exhausted: bool,
    ) -> Result<String, PromptError> {
        self.render(
            "executor_forced_summary",
            context! {
                task => task,
                max_rounds => max_rounds,
                exhausted => exhausted,
            },
        )
    }

    pub fn analyzer(&self, executed: &ExecutedTask) -> Result<String, PromptError> {
        let history = render_cmd_history(&executed.cmd_history);
        self.render(
            "analyzer",
            context! {
                task => executed.task.as_ref(),
                summary => executed.summary.trim(),
                history => non_empty(&history),
            },
        )
    }

    pub fn knowledge_merge(
        &self,
        existing: &KnowledgeCorpus,
        facts: &[String],
        vulnerabilities: &[String],
    ) -> Result<String, PromptError> {
        self.render(
            "knowledge_merge",
            context! {
                existing => non_empty(existing.as_str()),
                facts => facts,
                vulnerabilities => vulnerabilities,
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String, PromptError> {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .map_err(|err| PromptError {
                template: name.to_string(),
                message: format!("{err:#}"),
            })?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes).map_err(|message| {
            PromptError {
                template: name.to_string(),
                message,
            }
        })?;
        let prompt = render_sections(&sections);
        debug!(template = name, bytes = prompt.len(), "rendered prompt");
        Ok(prompt)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content after its marker.
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// Split rendered output at its section markers. Text before the first marker
/// is ignored; empty droppable sections are skipped.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    markers
        .iter()
        .enumerate()
        .filter_map(|(i, (_, end, key, required))| {
            let next = markers
                .get(i + 1)
                .map(|(start, ..)| *start)
                .unwrap_or(rendered.len());
            let content = rendered[*end..next].trim().to_string();
            (!content.is_empty() || *required).then(|| ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            })
        })
        .collect()
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Fails when the sections left after dropping and truncating still exceed
/// the budget, which happens when the plan alone is too large.
fn apply_budget_to_sections(
    sections: &mut Vec<ParsedSection>,
    budget: usize,
) -> Result<(), String> {
    if total_len(sections) <= budget {
        return Ok(());
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let target = sections
        .iter()
        .rposition(|s| !NEVER_TRUNCATED.contains(&s.key.as_str()));
    if let Some(idx) = target {
        let other_len = total_len(sections) - sections[idx].content.len();
        truncate_section(&mut sections[idx], budget.saturating_sub(other_len));
    }

    let total = total_len(sections);
    if total > budget {
        return Err(format!(
            "prompt needs {total} bytes after dropping and truncation, budget is {budget}; \
             sections {:?} cannot be cut",
            sections
                .iter()
                .filter(|s| NEVER_TRUNCATED.contains(&s.key.as_str()))
                .map(|s| s.key.as_str())
                .collect::<Vec<_>>()
        ));
    }
    Ok(())
}

fn truncate_section(section: &mut ParsedSection, allowed: usize) {
    let before_len = section.content.len();
    if before_len <= allowed {
        return;
    }
    if allowed > TRUNCATED.len() {
        truncate_to_boundary(&mut section.content, allowed - TRUNCATED.len());
        section.content.push_str(TRUNCATED);
    } else {
        truncate_to_boundary(&mut section.content, allowed);
    }
    debug!(
        section = %section.key,
        before_len,
        after_len = section.content.len(),
        "truncated section for budget"
    );
}

fn truncate_to_boundary(text: &mut String, max_len: usize) {
    let mut cut = max_len.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::{AnalyzedExecution, ToolResult};

    fn executed() -> ExecutedTask {
        ExecutedTask {
            task: Arc::new(Task::new("enumerate SMB shares", "dc01 at 10.0.0.10")),
            summary: "found share SYSVOL".to_string(),
            cmd_history: vec![ToolResult {
                tool: "execute_command".to_string(),
                cmd: "smbclient -L //10.0.0.10 -N".to_string(),
                finished: true,
                result: "SYSVOL Disk".to_string(),
            }],
        }
    }

    #[test]
    fn first_update_asks_for_new_plan() {
        let prompt = PromptEngine::new(40_000)
            .planner_update("Become domain admin.", None, &Plan::empty())
            .expect("render");
        assert!(prompt.contains("There is no task plan yet, generate a new plan."));
        assert!(prompt.contains("Become domain admin."));
        assert!(!prompt.contains("### Last Task"));
        assert!(!prompt.contains("<!--"));
    }

    #[test]
    fn update_sections_follow_template_order() {
        let outcome = TaskOutcome::Analyzed {
            executed: executed(),
            analysis: AnalyzedExecution {
                gathered_knowledge: vec!["dc01 runs SMB".to_string()],
                vulnerabilities: vec!["null session".to_string()],
                potential_next_steps: vec!["read SYSVOL".to_string()],
                invalid_commands: Vec::new(),
            },
        };
        let prompt = PromptEngine::new(40_000)
            .planner_update("scenario", Some(&outcome), &Plan::from_text("1. Recon"))
            .expect("render");
        let order = [
            "### Planner Contract",
            "### Scenario",
            "### Current Plan",
            "### Last Task",
            "### Result Summary",
            "### Extracted Facts",
            "### Potential Next Steps",
            "### Command History",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|header| prompt.find(header).unwrap_or_else(|| panic!("{header}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{prompt}");
        assert!(prompt.contains("- Vulnerability: null session"));
        assert!(prompt.contains("$ smbclient -L //10.0.0.10 -N"));
    }

    #[test]
    fn budget_drops_history_before_knowledge() {
        let task = Task::new("crack hashes", "");
        let invalid = vec![InvalidCommand {
            command: "hashcat -m 1000 h".to_string(),
            problem: "hashcat: missing wordlist".to_string(),
            fixed_command: "hashcat -m 1000 h rockyou.txt".to_string(),
        }];
        let knowledge = KnowledgeCorpus::new("k".repeat(300));
        let engine = PromptEngine::new(200);
        let prompt = engine
            .executor_task(&task, &knowledge, &invalid)
            .expect("render");
        assert!(prompt.contains("### Task"));
        assert!(!prompt.contains("### Known Invalid Commands"));
        assert!(!prompt.contains("### Known Facts"));
        assert!(prompt.len() <= 200 + TRUNCATED.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "contract".to_string(),
            required: true,
            content: "ä".repeat(50),
        }];
        apply_budget_to_sections(&mut sections, 31).expect("fits after truncation");
        assert!(sections[0].content.ends_with(TRUNCATED));
        assert!(sections[0].content.len() <= 31);
    }

    #[test]
    fn budget_cuts_scenario_instead_of_plan() {
        let plan = Plan::from_text(format!("1. Recon\n{}", "1.1. scan host\n".repeat(40)));
        let scenario = "s".repeat(2_000);
        let prompt = PromptEngine::new(2_000)
            .planner_select(&scenario, &plan, &KnowledgeCorpus::new("- dc01"))
            .expect("render");
        assert!(prompt.contains(plan.text.trim()));
        assert!(prompt.contains(TRUNCATED));
        assert!(!prompt.contains("### Known Facts"));
    }

    #[test]
    fn oversized_plan_is_an_error_not_a_cut() {
        let plan = Plan::from_text(format!("1. Recon\n{}", "1.1. scan host\n".repeat(200)));
        let err = PromptEngine::new(1_000)
            .planner_select("scenario", &plan, &KnowledgeCorpus::default())
            .expect_err("plan larger than budget");
        assert_eq!(err.template, "planner_select");
        assert!(err.message.contains("[\"plan\"]"), "{}", err.message);
    }

    #[test]
    fn merge_prompt_lists_new_items() {
        let prompt = PromptEngine::new(40_000)
            .knowledge_merge(
                &KnowledgeCorpus::default(),
                &["user alice".to_string()],
                &["MS17-010 on 10.0.0.7".to_string()],
            )
            .expect("render");
        assert!(prompt.contains("Nothing is known yet."));
        assert!(prompt.contains("- user alice"));
        assert!(prompt.contains("- MS17-010 on 10.0.0.7"));
    }

    #[test]
    fn forced_summary_names_round_limit() {
        let prompt = PromptEngine::new(40_000)
            .executor_forced_summary(&Task::new("scan", ""), 2, true)
            .expect("render");
        assert!(prompt.contains("all 2 rounds"));
        let early = PromptEngine::new(40_000)
            .executor_forced_summary(&Task::new("scan", ""), 2, false)
            .expect("render");
        assert!(early.contains("neither commands nor a summary"));
    }
}
