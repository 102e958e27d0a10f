//! Prompt rendering for provider calls.
//!
//! Templates are embedded minijinja sources. The user prompt is split into
//! `<!-- section:KEY required|droppable -->` blocks so it can be fitted to a
//! byte budget by dropping context before instructions.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::phase::{Mode, Phase};
use crate::core::status_block::StatusCodec;
use crate::core::task_graph::Wave;
use crate::io::git::GitProgress;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

const PHASE_TEMPLATES: [(Phase, &str, &str); 8] = [
    (Phase::Discover, "discover", include_str!("prompts/discover.md")),
    (Phase::Plan, "plan", include_str!("prompts/plan.md")),
    (Phase::Implement, "implement", include_str!("prompts/implement.md")),
    (Phase::Review, "review", include_str!("prompts/review.md")),
    (Phase::Test, "test", include_str!("prompts/test.md")),
    (Phase::FinalReview, "final_review", include_str!("prompts/final_review.md")),
    (Phase::Commit, "commit", include_str!("prompts/commit.md")),
    (Phase::Roadmap, "roadmap", include_str!("prompts/roadmap.md")),
];

/// Context sections are dropped in this order when the prompt is over budget.
const DROP_ORDER: [&str; 3] = ["decisions", "wave", "context"];

/// Section truncated as a last resort; it is the only unbounded operator input.
const TRUNCATE_SECTION: &str = "task";
const TRUNCATED_NOTICE: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

/// Human-readable counters handed to a stateless provider each turn.
#[derive(Debug, Clone, Serialize)]
pub struct LoopContext {
    /// 1-indexed current cycle.
    pub cycle: u32,
    pub completed_cycles: u32,
    pub total_iterations: u32,
    pub phase_iterations: u32,
    pub cycle_iterations: u32,
    pub tasks_completed: usize,
    /// Cumulative cost, preformatted with two decimals.
    pub cost: String,
    pub git: Option<GitProgress>,
    pub recent_decisions: Option<String>,
    pub next_wave: Option<WaveSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveSummary {
    pub number: u32,
    pub tasks: Vec<WaveTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveTask {
    pub id: String,
    pub name: String,
}

impl From<&Wave<'_>> for WaveSummary {
    fn from(wave: &Wave<'_>) -> Self {
        Self {
            number: wave.number,
            tasks: wave
                .tasks
                .iter()
                .map(|task| WaveTask {
                    id: task.id.clone(),
                    name: task.name.clone(),
                })
                .collect(),
        }
    }
}

/// Inputs for one user prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub phase: Phase,
    pub mode: Mode,
    pub plan_path: &'a Path,
    pub plan_json_path: &'a Path,
    pub decisions_path: &'a Path,
    pub context: Option<&'a LoopContext>,
}

#[derive(Debug, Serialize)]
struct PhaseEntry {
    number: u8,
    name: &'static str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("iteration", ITERATION_TEMPLATE)
            .context("load iteration template")?;
        for (_, name, source) in PHASE_TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env, budget_bytes })
    }

    /// Render the per-run instructions, including the status block format.
    pub fn render_system(
        &self,
        codec: &StatusCodec,
        mode: Mode,
        decisions_path: &Path,
    ) -> Result<String> {
        let phases: Vec<&str> = mode.phases().iter().map(|phase| phase.name()).collect();
        let rendered = self
            .env
            .get_template("system")?
            .render(context! {
                phases => phases,
                decisions_path => decisions_path.display().to_string(),
                start_marker => codec.start_marker(),
                end_marker => codec.end_marker(),
            })
            .context("render system prompt")?;
        Ok(rendered.trim().to_string())
    }

    /// Render the user prompt for one iteration, fitted to the byte budget.
    pub fn render_user(&self, input: &PromptInputs<'_>) -> Result<String> {
        let instructions = self.render_phase(input)?;
        let plan_json_path = input
            .plan_json_path
            .exists()
            .then(|| input.plan_json_path.display().to_string());
        let rendered = self
            .env
            .get_template("iteration")?
            .render(context! {
                task => input.task.trim(),
                creating_plan => input.phase == Phase::Plan,
                plan_path => input.plan_path.display().to_string(),
                plan_json_path => plan_json_path,
                context => input.context,
                phase_label => input.phase.to_string(),
                instructions => instructions.trim(),
            })
            .context("render iteration prompt")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }

    fn render_phase(&self, input: &PromptInputs<'_>) -> Result<String> {
        let name = PHASE_TEMPLATES
            .iter()
            .find(|(phase, _, _)| *phase == input.phase)
            .map(|(_, name, _)| *name)
            .context("no template for phase")?;
        let phases: Vec<PhaseEntry> = input
            .mode
            .phases()
            .iter()
            .map(|phase| PhaseEntry {
                number: phase.number(),
                name: phase.name(),
            })
            .collect();
        self.env
            .get_template(name)?
            .render(context! {
                plan_path => input.plan_path.display().to_string(),
                plan_json_path => input.plan_json_path.display().to_string(),
                decisions_path => input.decisions_path.display().to_string(),
                phases => phases,
            })
            .with_context(|| format!("render {name} instructions"))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
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

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    if let Some(section) = sections.iter_mut().find(|s| s.key == TRUNCATE_SECTION) {
        let before_len = section.content.len();
        let over = total - budget;
        let keep = before_len
            .saturating_sub(over)
            .saturating_sub(TRUNCATED_NOTICE.len());
        truncate_at_char_boundary(&mut section.content, keep);
        section.content.push_str(TRUNCATED_NOTICE);
        debug!(
            section = TRUNCATE_SECTION,
            before_len,
            after_len = section.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
