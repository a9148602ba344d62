//! Persisted plan and knowledge files for resuming a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::{KnowledgeCorpus, Plan};

pub const PLAN_FILE: &str = "plan.md";
pub const KNOWLEDGE_FILE: &str = "knowledge.md";

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub plan_path: PathBuf,
    pub knowledge_path: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            plan_path: dir.join(PLAN_FILE),
            knowledge_path: dir.join(KNOWLEDGE_FILE),
        }
    }
}

/// Write the current plan and knowledge, replacing earlier copies.
pub fn write_state(paths: &StatePaths, plan: &Plan, knowledge: &KnowledgeCorpus) -> Result<()> {
    write_atomic(&paths.plan_path, &ensure_trailing_newline(&plan.text))?;
    write_atomic(
        &paths.knowledge_path,
        &ensure_trailing_newline(knowledge.as_str()),
    )
}

/// Read a previously persisted plan; an empty file yields an empty plan.
pub fn read_plan(path: &Path) -> Result<Plan> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    Ok(Plan::from_text(text.trim_end()))
}

pub fn read_knowledge(path: &Path) -> Result<KnowledgeCorpus> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read knowledge {}", path.display()))?;
    Ok(KnowledgeCorpus::new(text.trim_end()))
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn ensure_trailing_newline(text: &str) -> String {
    let mut out = text.trim_end().to_string();
    out.push('\n');
    out
}
