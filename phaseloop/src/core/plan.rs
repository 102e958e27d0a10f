//! Checklist plan tracking.
//!
//! A plan is markdown with `## Phase <N>: <NAME>` headers and top-level task
//! lines `- [ ]`, `- [x]` or `- [~]`. A task belongs to the most recent phase
//! header above it; tasks before the first header belong to no phase. Any
//! other `## Phase ...` heading closes the current section.
//!
//! A plan that does not exist is treated as an empty plan everywhere: it has
//! no unchecked tasks, so every phase is vacuously complete.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::phase::Phase;

static PHASE_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+(?i:phase)(?:\s|$)").expect("phase heading regex is valid")
});

static PHASE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+(?i:phase)\s+(\d+)\s*:").expect("phase number regex is valid")
});

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s+\[([ xX~])\]\s*(.*)$").expect("task regex is valid")
});

/// Checkbox state of a plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMark {
    Checked,
    Unchecked,
    Skipped,
}

/// One top-level checklist line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTask {
    /// Phase number of the enclosing section, if any.
    pub phase: Option<u8>,
    pub mark: TaskMark,
    pub description: String,
    /// 1-indexed line number in the plan document.
    pub line: usize,
}

/// Parsed plan document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanDocument {
    tasks: Vec<PlanTask>,
}

impl PlanDocument {
    /// The plan used when no plan file exists.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut tasks = Vec::new();
        let mut current: Option<u8> = None;
        for (idx, line) in text.lines().enumerate() {
            if PHASE_HEADING_RE.is_match(line) {
                current = PHASE_NUMBER_RE
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok());
                continue;
            }
            let Some(caps) = TASK_RE.captures(line) else {
                continue;
            };
            let mark = match caps.get(1).map(|m| m.as_str()) {
                Some("x" | "X") => TaskMark::Checked,
                Some("~") => TaskMark::Skipped,
                _ => TaskMark::Unchecked,
            };
            tasks.push(PlanTask {
                phase: current,
                mark,
                description: caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                line: idx + 1,
            });
        }
        Self { tasks }
    }

    pub fn tasks(&self) -> &[PlanTask] {
        &self.tasks
    }

    /// Tasks inside the section for `phase`.
    pub fn tasks_in(&self, phase: Phase) -> impl Iterator<Item = &PlanTask> {
        self.tasks
            .iter()
            .filter(move |task| task.phase == Some(phase.number()))
    }

    pub fn has_unchecked_tasks(&self, phase: Phase) -> bool {
        self.tasks_in(phase)
            .any(|task| task.mark == TaskMark::Unchecked)
    }

    /// Exact negation of [`Self::has_unchecked_tasks`]; empty sections are complete.
    pub fn is_complete(&self, phase: Phase) -> bool {
        !self.has_unchecked_tasks(phase)
    }

    /// Checked tasks anywhere in the plan.
    pub fn checked_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.mark == TaskMark::Checked)
            .count()
    }

    /// Unchecked tasks anywhere in the plan, including unscoped ones.
    pub fn unchecked_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.mark == TaskMark::Unchecked)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_plan;

    #[test]
    fn scopes_tasks_to_their_phase_section() {
        let plan = PlanDocument::parse(&sample_plan());
        assert!(plan.is_complete(Phase::Plan));
        assert!(plan.has_unchecked_tasks(Phase::Implement));
        assert_eq!(plan.tasks_in(Phase::Implement).count(), 3);
        assert!(plan.has_unchecked_tasks(Phase::Review));
        assert!(plan.is_complete(Phase::Commit));
    }

    #[test]
    fn tasks_before_any_header_belong_to_no_phase() {
        let plan = PlanDocument::parse("- [ ] stray task\n\n## Phase 1: PLAN\n- [x] analyse\n");
        assert_eq!(plan.tasks()[0].phase, None);
        for phase in Phase::ALL {
            assert!(plan.is_complete(phase), "{phase} should be complete");
        }
        assert_eq!(plan.unchecked_count(), 1);
    }

    #[test]
    fn skipped_tasks_do_not_block_completion() {
        let plan = PlanDocument::parse("## Phase 4: TEST\n- [x] run tests\n- [~] run e2e suite\n");
        assert!(plan.is_complete(Phase::Test));
        assert_eq!(plan.tasks()[1].mark, TaskMark::Skipped);
    }

    #[test]
    fn phases_without_tasks_are_vacuously_complete() {
        let plan = PlanDocument::parse("## Phase 3: REVIEW\nNo findings yet.\n");
        assert!(plan.is_complete(Phase::Review));
        assert!(!plan.has_unchecked_tasks(Phase::Review));
    }

    #[test]
    fn indented_sub_tasks_are_ignored() {
        let plan = PlanDocument::parse("## Phase 2: IMPLEMENT\n- [x] parser\n  - [ ] manual check\n");
        assert!(plan.is_complete(Phase::Implement));
    }

    #[test]
    fn is_complete_negates_has_unchecked_for_every_phase() {
        let plan = PlanDocument::parse(&sample_plan());
        for phase in Phase::ALL {
            assert_eq!(plan.is_complete(phase), !plan.has_unchecked_tasks(phase));
        }
        let empty = PlanDocument::empty();
        for phase in Phase::ALL {
            assert!(empty.is_complete(phase));
        }
    }

    #[test]
    fn counts_checked_tasks_across_sections() {
        let plan = PlanDocument::parse(&sample_plan());
        assert_eq!(plan.checked_count(), 3);
    }

    #[test]
    fn unnumbered_phase_heading_closes_the_section() {
        let plan = PlanDocument::parse(
            "## Phase 3: REVIEW\n- [x] review diff\n\n## Phase notes\n- [ ] ask about logging\n",
        );
        assert!(plan.is_complete(Phase::Review));
        assert_eq!(plan.tasks()[1].phase, None);
        assert_eq!(plan.unchecked_count(), 1);
    }

    #[test]
    fn other_headings_keep_the_section_open() {
        let plan = PlanDocument::parse("## Phase 4: TEST\n## Phased rollout\n- [ ] smoke test\n");
        assert!(plan.has_unchecked_tasks(Phase::Test));
    }

    #[test]
    fn header_match_ignores_case_of_phase_word() {
        let plan = PlanDocument::parse("## PHASE 5: FINAL-REVIEW\n- [ ] re-read diff\n");
        assert!(plan.has_unchecked_tasks(Phase::FinalReview));
    }
}
