//! Read-only summary of a persisted run for `phaseloop status`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::session::SessionState;
use crate::error::PhaseloopError;
use crate::io::config::Config;
use crate::io::plan_file::read_plan;
use crate::io::session_store::load_state;
use crate::start::locate_run;

/// Session state plus plan progress of one run.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run_id: String,
    pub run_path: PathBuf,
    pub state: SessionState,
    pub tasks_checked: usize,
    pub tasks_unchecked: usize,
}

/// Load the status of `run_dir`, or of the latest run when `None`.
///
/// Never contacts the provider and never writes to the run directory.
pub fn run_status(
    root: &Path,
    config: &Config,
    run_dir: Option<&Path>,
) -> Result<RunStatus, PhaseloopError> {
    let run = locate_run(root, config, run_dir)?;
    let state = load_state(&run.state_path)?;
    let plan = read_plan(&run.plan_path)?;
    Ok(RunStatus {
        run_id: run.id,
        run_path: run.path,
        tasks_checked: plan.checked_count(),
        tasks_unchecked: plan.unchecked_count(),
        state,
    })
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = &self.state;
        writeln!(f, "run:        {} ({})", self.run_id, self.run_path.display())?;
        writeln!(f, "task:       {}", first_line(&state.prompt))?;
        writeln!(f, "mode:       {}", state.mode.as_str())?;
        match state.completed_at {
            Some(at) => writeln!(f, "state:      complete at {}", at.to_rfc3339())?,
            None => writeln!(f, "state:      in progress at {}", state.current_phase)?,
        }
        writeln!(
            f,
            "iterations: {} total, {} in phase, {} in cycle",
            state.total_iterations, state.phase_iterations, state.cycle_iterations
        )?;
        writeln!(f, "cycles:     {} completed", state.cycle)?;
        writeln!(f, "cost:       ${:.4}", state.cost_usd)?;
        writeln!(
            f,
            "plan:       {} checked, {} open",
            self.tasks_checked, self.tasks_unchecked
        )?;
        let breaker = &state.breaker;
        writeln!(
            f,
            "breaker:    no-progress {}, repeated-error {}, test-only {}, blocked {}",
            breaker.no_progress_streak,
            breaker.repeated_error_streak,
            breaker.test_only_streak,
            breaker.blocked_streak
        )?;
        if let Some(commit) = &state.starting_commit {
            writeln!(f, "started at: {commit}")?;
        }
        write!(f, "updated:    {}", state.updated_at.to_rfc3339())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
