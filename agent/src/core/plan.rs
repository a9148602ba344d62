//! Parsing helpers for the hierarchically numbered plan text.
//!
//! The plan itself stays free-form text owned by the planner; these helpers
//! only recognise numbered items (`1.`, `1.1.`, `1.1.1.`) so the planner can
//! check that an update produced a usable tree.

use std::sync::LazyLock;

use regex::Regex;

/// One numbered line of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    /// Numbering segments, e.g. `[1, 2]` for `1.2.`.
    pub number: Vec<u32>,
    pub text: String,
}

impl PlanItem {
    pub fn depth(&self) -> usize {
        self.number.len()
    }

    pub fn is_root(&self) -> bool {
        self.number.len() == 1
    }

    /// Dotted label with trailing dot (`1.2.`).
    pub fn label(&self) -> String {
        let mut label = self
            .number
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        label.push('.');
        label
    }

    fn parent_number(&self) -> &[u32] {
        &self.number[..self.depth().saturating_sub(1)]
    }
}

// Optional list/heading/bold markers, the number, an optional trailing dot, then text.
static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]\s+|#{1,6}\s+)?\**(\d+(?:\.\d+)*)(\.?)\**\s+(\S.*)$").unwrap()
});

/// Parse every numbered item in plan order.
///
/// Root items must end their number with a dot, so prose such as `2022 was ...`
/// is not mistaken for an item. Nested numbers may drop the trailing dot
/// (`1.1 Scan`) as long as they have at most three segments, which keeps an
/// IP address at the start of a line out.
pub fn parse_items(text: &str) -> Vec<PlanItem> {
    text.lines()
        .filter_map(|line| {
            let caps = ITEM_RE.captures(line)?;
            let raw_number = caps.get(1)?.as_str();
            let dotted = !caps.get(2)?.as_str().is_empty();
            let number: Vec<u32> = raw_number
                .split('.')
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            if !dotted && !(2..=3).contains(&number.len()) {
                return None;
            }
            Some(PlanItem {
                number,
                text: caps.get(3)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Root-level items (`1.`, `2.`, ...).
pub fn root_items(text: &str) -> Vec<PlanItem> {
    parse_items(text)
        .into_iter()
        .filter(PlanItem::is_root)
        .collect()
}

/// Check the one structural property a replacement plan must have: at least
/// one root-level item.
pub fn validate_plan_text(text: &str) -> Vec<String> {
    if root_items(text).is_empty() {
        return vec!["plan has no root-level item (expected `1.`)".to_string()];
    }
    Vec::new()
}

/// Nested items whose parent number appears nowhere in the plan.
pub fn orphan_items(text: &str) -> Vec<PlanItem> {
    let items = parse_items(text);
    items
        .iter()
        .filter(|item| {
            !item.is_root()
                && !items
                    .iter()
                    .any(|other| other.number == item.parent_number())
        })
        .cloned()
        .collect()
}
