//! Plan sanity checks run when the PLAN phase hands over to IMPLEMENT.
//!
//! Findings are advisory. A plan with open questions or without implementation
//! tasks is reported to the operator and recorded, but never stops the run.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::phase::Phase;
use crate::core::plan::PlanDocument;

const SNIPPET_CHARS: usize = 80;

static UNRESOLVED_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\?\s*$",
        r"\[\?\]",
        r"\?\?",
        r"(?i)\bTB[DA]\b",
        r"(?i)\bTO\s*BE\s*(?:DETERMINED|DECIDED)\b",
        r"(?i)\bPLACEHOLDER\b",
        r"(?i)\bTODO:\s*(?:decide|clarify|confirm)\b",
        r"(?i)\b(?:UNSURE|UNCLEAR)\b",
        r"(?i)\bNEED\s*TO\s*(?:CONFIRM|CLARIFY|DECIDE)\b",
        r"(?i)\b(?:PENDING\s*DECISION|AWAITING\s*INPUT)\b",
        r"(?i)^#+\s*(?:Open\s*)?Questions?\s*$",
        r"(?i)^#+\s*(?:Unresolved|Decisions\s*Needed)\s*$",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("unresolved pattern is valid"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    /// No plan file was written.
    Missing,
    /// A line still carries an open question or placeholder.
    Unresolved { line: usize, snippet: String },
    /// The IMPLEMENT section has no tasks.
    NoImplementationTasks,
}

impl std::fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanIssue::Missing => write!(f, "plan file does not exist"),
            PlanIssue::Unresolved { line, snippet } => {
                write!(f, "unresolved item on line {line}: {snippet}")
            }
            PlanIssue::NoImplementationTasks => {
                write!(f, "{} has no tasks defined", Phase::Implement)
            }
        }
    }
}

/// Check plan text (`None` when the file is absent) for open items.
pub fn validate_plan(text: Option<&str>) -> Vec<PlanIssue> {
    let Some(text) = text else {
        return vec![PlanIssue::Missing];
    };

    let mut issues = Vec::new();
    let mut in_code_block = false;
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_code_block = !in_code_block;
            continue;
        }
        if in_code_block || trimmed.starts_with("- [x]") || trimmed.starts_with("- [~]") {
            continue;
        }
        if UNRESOLVED_RE.iter().any(|re| re.is_match(line)) {
            issues.push(PlanIssue::Unresolved {
                line: idx + 1,
                snippet: snippet(trimmed),
            });
        }
    }

    if PlanDocument::parse(text)
        .tasks_in(Phase::Implement)
        .next()
        .is_none()
    {
        issues.push(PlanIssue::NoImplementationTasks);
    }
    issues
}

fn snippet(line: &str) -> String {
    if line.chars().count() <= SNIPPET_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(SNIPPET_CHARS).collect();
    cut.push_str("...");
    cut
}
