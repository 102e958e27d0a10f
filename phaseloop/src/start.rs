//! Entry points for starting a new run and resuming an existing one.
//!
//! A run lives in `<runs_dir>/<prefix>-<YYYYMMDD-HHMMSS>/` and is owned by
//! exactly one process at a time. Starting creates the directory and the
//! initial session state; resuming reloads that state and continues the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, Utc};
use tracing::{debug, info, instrument};

use crate::core::session::SessionState;
use crate::error::{PhaseloopError, ProviderError, StateError};
use crate::interrupt::InterruptFlag;
use crate::io::config::Config;
use crate::io::decisions_log::DecisionsLog;
use crate::io::git::Git;
use crate::io::provider::Provider;
use crate::io::run_dir::RunDir;
use crate::io::session_store::{load_state, save_state};
use crate::orchestrator::{LoopOutcome, LoopStop, Workflow};
use crate::report::Reporter;

/// Collaborators shared by `start` and `resume`.
pub struct RunContext<'a> {
    pub root: &'a Path,
    pub config: &'a Config,
    pub provider: &'a dyn Provider,
    pub reporter: Arc<dyn Reporter>,
    pub interrupt: InterruptFlag,
}

impl RunContext<'_> {
    fn runs_dir(&self) -> PathBuf {
        self.root.join(&self.config.runs_dir)
    }
}

/// Create a fresh run for `prompt` and drive it to a stop.
#[instrument(skip_all, fields(root = %ctx.root.display(), mode = ctx.config.mode.as_str()))]
pub fn start_run(ctx: &RunContext<'_>, prompt: &str) -> Result<LoopOutcome, PhaseloopError> {
    if !ctx.provider.is_available() {
        return Err(PhaseloopError::Provider {
            iteration: 0,
            source: ProviderError::fatal(format!(
                "provider `{}` is not available",
                ctx.config.provider.command
            )),
        });
    }

    let run = RunDir::create(
        &ctx.runs_dir(),
        &ctx.config.run_prefix,
        Local::now().naive_local(),
    )?;
    let starting_commit = match Git::new(ctx.root).head_sha() {
        Ok(sha) => Some(sha),
        Err(err) => {
            debug!(err = %err, "no starting commit");
            None
        }
    };

    let now = Utc::now();
    let mut state = SessionState::new(prompt, ctx.config.mode, starting_commit, now);
    save_state(&run.state_path, &state)?;
    let mut lines = vec![
        format!("task: {}", prompt.trim()),
        format!("mode: {}", ctx.config.mode.as_str()),
        format!(
            "limits: {} iterations, ${:.2}, {} cycle(s)",
            ctx.config.max_iterations, ctx.config.cost_limit_usd, ctx.config.max_cycles
        ),
    ];
    if let Some(sha) = &state.starting_commit {
        lines.push(format!("starting commit: {sha}"));
    }
    DecisionsLog::new(run.decisions_path.clone()).record(0, "Run started", &lines, now)?;

    info!(run_id = %run.id, "run created");
    ctx.reporter
        .info(&format!("run {} started in {}", run.id, run.path.display()));
    drive(ctx, run, &mut state)
}

/// Continue the run in `run_dir`, or the latest run when `None`.
#[instrument(skip_all, fields(root = %ctx.root.display()))]
pub fn resume_run(
    ctx: &RunContext<'_>,
    run_dir: Option<&Path>,
) -> Result<LoopOutcome, PhaseloopError> {
    let run = locate_run(ctx.root, ctx.config, run_dir)?;
    let mut state = load_state(&run.state_path)?;

    if state.is_complete() {
        ctx.reporter
            .info(&format!("run {} is already complete", run.id));
        return Ok(LoopOutcome {
            run_id: run.id,
            iterations_executed: 0,
            stop: LoopStop::Complete { cycles: state.cycle },
        });
    }

    info!(
        run_id = %run.id,
        phase = %state.current_phase,
        total_iterations = state.total_iterations,
        "resuming run"
    );
    ctx.reporter.info(&format!(
        "resuming run {} at {} (iteration {}, ${:.2} spent)",
        run.id, state.current_phase, state.total_iterations, state.cost_usd
    ));
    DecisionsLog::new(run.decisions_path.clone()).record(
        state.total_iterations,
        "Run resumed",
        &[format!("phase: {}", state.current_phase)],
        Utc::now(),
    )?;
    drive(ctx, run, &mut state)
}

/// Find the run directory to operate on.
///
/// A missing run is [`StateError::Missing`] so the caller can tell
/// "nothing to resume" apart from other failures.
pub fn locate_run(
    root: &Path,
    config: &Config,
    run_dir: Option<&Path>,
) -> Result<RunDir, PhaseloopError> {
    match run_dir {
        Some(path) => {
            let path = root.join(path);
            if !path.is_dir() {
                return Err(StateError::Missing { path }.into());
            }
            Ok(RunDir::open(&path, &config.run_prefix)?)
        }
        None => {
            let runs_dir = root.join(&config.runs_dir);
            RunDir::find_last(&runs_dir, &config.run_prefix)?
                .ok_or_else(|| StateError::Missing { path: runs_dir }.into())
        }
    }
}

fn drive(
    ctx: &RunContext<'_>,
    run: RunDir,
    state: &mut SessionState,
) -> Result<LoopOutcome, PhaseloopError> {
    let workflow = Workflow::new(
        ctx.root,
        ctx.config,
        run,
        ctx.provider,
        ctx.reporter.clone(),
        ctx.interrupt.clone(),
    )?;
    workflow.run(state)
}
