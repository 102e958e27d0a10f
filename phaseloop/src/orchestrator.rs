//! The workflow loop: one provider call per iteration until a stop condition.
//!
//! Each iteration renders the prompts for the current phase, calls the
//! provider, parses the status block, folds it into the session state, asks
//! the circuit breaker and then the transition engine what to do, and persists
//! the state before the next iteration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::circuit_breaker::{self, BreakerOutcome, TripReason};
use crate::core::limits::{self, LimitBreach};
use crate::core::phase::Phase;
use crate::core::plan::PlanDocument;
use crate::core::plan_validation::validate_plan;
use crate::core::session::SessionState;
use crate::core::status_block::{BlockedDetails, StatusCodec};
use crate::core::transition::{Transition, next_transition};
use crate::error::PhaseloopError;
use crate::exit_codes;
use crate::interrupt::InterruptFlag;
use crate::io::config::Config;
use crate::io::decisions_log::DecisionsLog;
use crate::io::git::Git;
use crate::io::heartbeat::Heartbeat;
use crate::io::iteration_log::{
    BreakerRecord, IterationMeta, IterationPaths, write_meta, write_output, write_prompt,
};
use crate::io::plan_file::{archive_plan, load_structured_plan, read_plan, read_plan_text};
use crate::io::prompt::{LoopContext, PromptEngine, PromptInputs, WaveSummary};
use crate::io::provider::{Provider, ProviderRequest, RetryPolicy};
use crate::io::run_dir::RunDir;
use crate::io::session_store::save_state;
use crate::report::Reporter;

/// Decision log lines included in the loop context.
const RECENT_DECISION_LINES: usize = 20;

/// Consecutive later cycles without IMPLEMENT work that end the run.
const NO_WORK_CYCLE_LIMIT: u32 = 2;

/// Reason why [`Workflow::run`] stopped without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// The final cycle reached DONE.
    Complete { cycles: u32 },
    /// Consecutive later cycles planned no implementation work.
    NoRemainingWork { cycle: u32 },
    /// Progress stalled because every plan task is already checked.
    AllTasksComplete,
    /// The agent reported BLOCKED repeatedly; resumable once resolved.
    Blocked { iterations: u32 },
    CircuitBreaker { reason: TripReason },
    Limit(LimitBreach),
    Interrupted,
}

impl LoopStop {
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopStop::Complete { .. }
            | LoopStop::NoRemainingWork { .. }
            | LoopStop::AllTasksComplete
            | LoopStop::Blocked { .. } => exit_codes::OK,
            LoopStop::CircuitBreaker { .. } => exit_codes::CIRCUIT_BREAKER,
            LoopStop::Limit(_) => exit_codes::LIMIT,
            LoopStop::Interrupted => exit_codes::INTERRUPTED,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LoopStop::Complete { cycles } if *cycles == 1 => "workflow complete".to_string(),
            LoopStop::Complete { cycles } => format!("workflow complete after {cycles} cycles"),
            LoopStop::NoRemainingWork { cycle } => format!(
                "no implementation work planned for {NO_WORK_CYCLE_LIMIT} consecutive cycles (stopped in cycle {cycle})"
            ),
            LoopStop::AllTasksComplete => "all plan tasks complete".to_string(),
            LoopStop::Blocked { iterations } => format!(
                "blocked on an external dependency for {iterations} iterations; resolve it and resume"
            ),
            LoopStop::CircuitBreaker { reason } => format!("circuit breaker triggered: {reason}"),
            LoopStop::Limit(breach) => breach.to_string(),
            LoopStop::Interrupted => "interrupted by operator".to_string(),
        }
    }
}

/// Summary of a [`Workflow::run`] invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Provider calls made by this invocation (not the run's lifetime total).
    pub iterations_executed: u32,
    pub stop: LoopStop,
}

/// Everything one run needs, wired together.
pub struct Workflow<'a> {
    root: PathBuf,
    config: &'a Config,
    run: RunDir,
    provider: &'a dyn Provider,
    reporter: Arc<dyn Reporter>,
    interrupt: InterruptFlag,
    prompts: PromptEngine,
    codec: StatusCodec,
    decisions: DecisionsLog,
    git: Git,
    retry: RetryPolicy,
}

impl<'a> Workflow<'a> {
    pub fn new(
        root: &Path,
        config: &'a Config,
        run: RunDir,
        provider: &'a dyn Provider,
        reporter: Arc<dyn Reporter>,
        interrupt: InterruptFlag,
    ) -> Result<Self> {
        let prompts = PromptEngine::new(config.prompt_budget_bytes)?;
        let decisions = DecisionsLog::new(run.decisions_path.clone());
        Ok(Self {
            root: root.to_path_buf(),
            config,
            run,
            provider,
            reporter,
            prompts,
            codec: StatusCodec::new(&config.status_marker),
            decisions,
            git: Git::new(root),
            retry: RetryPolicy::from_config(&config.provider).with_interrupt(interrupt.clone()),
            interrupt,
        })
    }

    pub fn run_dir(&self) -> &RunDir {
        &self.run
    }

    /// Iterate until a stop condition. Fatal errors persist the state first.
    #[instrument(skip_all, fields(run_id = %self.run.id))]
    pub fn run(&self, state: &mut SessionState) -> Result<LoopOutcome, PhaseloopError> {
        let mut executed = 0u32;
        let stop = loop {
            if self.interrupt.is_set() {
                break self.interrupted(state)?;
            }
            if let Some(breach) = limits::check(state, &self.config.limits()) {
                self.reporter.error(&format!("halting: {breach}"));
                self.record(
                    state.total_iterations,
                    "Halted: limit reached",
                    &[breach.to_string(), counters_line(state)],
                )?;
                self.persist(state)?;
                break LoopStop::Limit(breach);
            }
            executed += 1;
            if let Some(stop) = self.iterate(state)? {
                break stop;
            }
        };

        info!(executed, stop = ?stop, "workflow stopped");
        Ok(LoopOutcome {
            run_id: self.run.id.clone(),
            iterations_executed: executed,
            stop,
        })
    }

    #[instrument(skip_all, fields(phase = %state.current_phase))]
    fn iterate(&self, state: &mut SessionState) -> Result<Option<LoopStop>, PhaseloopError> {
        let iteration = state.begin_iteration();
        let phase = state.current_phase;
        let started_at = Utc::now();
        let started = Instant::now();
        info!(iteration, cycle = state.cycle + 1, "starting iteration");
        self.reporter.info(&format!(
            "iteration {iteration} (cycle {}): {phase}",
            state.cycle + 1
        ));

        let plan = read_plan(&self.run.plan_path)?;
        let context = if state.total_iterations > 1 {
            Some(self.loop_context(state, &plan)?)
        } else {
            None
        };
        let model = self
            .config
            .provider
            .model_for(phase.info().tier)
            .to_string();
        let system_prompt =
            self.prompts
                .render_system(&self.codec, state.mode, &self.run.decisions_path)?;
        let user_prompt = self.prompts.render_user(&PromptInputs {
            task: &state.prompt,
            phase,
            mode: state.mode,
            plan_path: &self.run.plan_path,
            plan_json_path: &self.run.plan_json_path,
            decisions_path: &self.run.decisions_path,
            context: context.as_ref(),
        })?;

        let paths = IterationPaths::new(&self.run.iterations_dir, iteration);
        write_prompt(&paths, &system_prompt, &user_prompt)?;
        let request = ProviderRequest {
            workdir: self.root.clone(),
            system_prompt,
            user_prompt,
            model: model.clone(),
            timeout: self.config.provider.timeout(),
        };

        let result = {
            let _heartbeat = self.start_heartbeat();
            self.provider.execute(&request, &self.retry)
        };
        let mut meta = IterationMeta {
            run_id: self.run.id.clone(),
            iteration,
            cycle: state.cycle + 1,
            phase,
            model,
            cost_usd: 0.0,
            total_cost_usd: state.cost_usd,
            started_at,
            ended_at: started_at,
            duration_ms: 0,
            status: None,
            breaker: None,
            transition: None,
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if let Some(cost) = err.cost_usd {
                    state.add_cost(cost);
                    meta.cost_usd = cost;
                }
                self.persist(state)?;
                self.finish_meta(&paths, &mut meta, state, started)?;
                if self.interrupt.is_set() {
                    debug!(err = %err, "provider call ended by interrupt");
                    return Ok(Some(self.interrupted(state)?));
                }
                self.reporter.error(&format!("provider failed: {err}"));
                self.record(iteration, "Halted: provider error", &[err.to_string()])?;
                return Err(PhaseloopError::Provider {
                    iteration,
                    source: err,
                });
            }
        };

        let cost = self.provider.get_cost(&response);
        state.add_cost(cost);
        meta.cost_usd = cost;
        fs::write(&self.run.last_output_path, &response.raw_output)
            .with_context(|| format!("write {}", self.run.last_output_path.display()))?;
        write_output(&paths, &response.content)?;

        let status = match self.provider.extract_status_block(&response, &self.codec) {
            Ok(status) => status,
            Err(err) => {
                self.persist(state)?;
                self.finish_meta(&paths, &mut meta, state, started)?;
                self.reporter.error(&format!("protocol error: {err}"));
                self.record(iteration, "Halted: protocol error", &[err.to_string()])?;
                return Err(PhaseloopError::Protocol {
                    iteration,
                    source: err,
                });
            }
        };
        debug!(status = %status.summary(), "parsed status block");
        meta.status = Some(status.summary());
        self.reporter.info(&format!("status: {}", status.summary()));
        if let Some(blocked) = &status.blocked {
            self.report_blocked(iteration, blocked)?;
        }

        let verdict = circuit_breaker::evaluate(state, &status, &self.config.breaker);
        state.exit_signal_received = status.exit_signal;
        match verdict {
            BreakerOutcome::Triggered(reason) => {
                meta.breaker = Some(BreakerRecord::Triggered {
                    reason: reason.clone(),
                });
                let stop = self.halt(state, iteration, reason)?;
                self.finish_iteration(&paths, &mut meta, state, started)?;
                return Ok(Some(stop));
            }
            BreakerOutcome::ExitSignal => meta.breaker = Some(BreakerRecord::ExitSignal),
            BreakerOutcome::Continue => meta.breaker = Some(BreakerRecord::Continue),
        }

        let plan = read_plan(&self.run.plan_path)?;
        let transition = next_transition(phase, status.exit_signal, &plan, state.mode);
        debug!(transition = ?transition, "transition decided");
        meta.transition = Some(transition);
        let stop = match transition {
            Transition::Stay => None,
            Transition::Enter(next) => self.enter_phase(state, iteration, next, &plan)?,
            Transition::Done => self.finish_cycle(state, iteration)?,
        };

        self.checkpoint(state, iteration)?;
        self.finish_iteration(&paths, &mut meta, state, started)?;
        Ok(stop)
    }

    /// Halt on a breaker trip. Stalling on a finished plan and repeated
    /// BLOCKED turns are graceful stops; everything else is a failure.
    fn halt(
        &self,
        state: &mut SessionState,
        iteration: u32,
        reason: TripReason,
    ) -> Result<LoopStop> {
        let finished =
            matches!(reason, TripReason::NoProgress { .. }) && self.all_tasks_checked()?;
        if finished {
            info!("no progress and no open plan tasks, finishing");
            state.mark_complete(Utc::now());
            self.reporter
                .success("all plan tasks are checked, nothing left to do");
            self.record(
                iteration,
                "All tasks complete",
                &[reason.to_string(), counters_line(state)],
            )?;
            return Ok(LoopStop::AllTasksComplete);
        }

        if let TripReason::Blocked { iterations } = reason {
            warn!(iterations, "halting: blocked on an external dependency");
            self.reporter.warn(&format!(
                "blocked for {iterations} iterations; resolve it, then run `phaseloop resume --run-dir {}`",
                self.run.path.display()
            ));
            self.record(
                iteration,
                "Halted: blocked",
                &[reason.to_string(), counters_line(state)],
            )?;
            return Ok(LoopStop::Blocked { iterations });
        }

        warn!(reason = %reason, "circuit breaker triggered");
        self.reporter
            .error(&format!("circuit breaker triggered: {reason}"));
        self.record(
            iteration,
            "Halted: circuit breaker",
            &[reason.to_string(), counters_line(state)],
        )?;
        Ok(LoopStop::CircuitBreaker { reason })
    }

    /// True when a plan exists and no phase section has an open task.
    fn all_tasks_checked(&self) -> Result<bool> {
        let Some(text) = read_plan_text(&self.run.plan_path)? else {
            return Ok(false);
        };
        let plan = PlanDocument::parse(&text);
        Ok(!Phase::ALL
            .into_iter()
            .any(|phase| plan.has_unchecked_tasks(phase)))
    }

    fn enter_phase(
        &self,
        state: &mut SessionState,
        iteration: u32,
        next: Phase,
        plan: &PlanDocument,
    ) -> Result<Option<LoopStop>> {
        let from = state.current_phase;
        if from == Phase::Plan && next == Phase::Implement && state.cycle >= 1 {
            if !plan.has_unchecked_tasks(Phase::Implement) {
                return self.skip_idle_cycle(state, iteration);
            }
            state.no_work_cycles = 0;
        }
        if from == Phase::Plan {
            self.check_plan(iteration)?;
        }
        state.enter_phase(next);
        info!(from = %from, to = %next, "phase transition");
        self.reporter.info(&format!("{from} -> {next}"));
        self.record(
            iteration,
            &format!("Phase transition: {} -> {}", from.name(), next.name()),
            &[format!("cycle {}", state.cycle + 1)],
        )?;
        Ok(None)
    }

    /// A later cycle planned no IMPLEMENT work: skip to the next cycle, or
    /// stop once that happens in consecutive cycles.
    fn skip_idle_cycle(
        &self,
        state: &mut SessionState,
        iteration: u32,
    ) -> Result<Option<LoopStop>> {
        state.no_work_cycles += 1;
        let cycle = state.cycle + 1;
        if state.no_work_cycles >= NO_WORK_CYCLE_LIMIT {
            state.mark_complete(Utc::now());
            self.reporter.success(&format!(
                "no implementation work planned for {} consecutive cycles, stopping",
                state.no_work_cycles
            ));
            self.record(
                iteration,
                "No remaining work",
                &[format!(
                    "cycle {cycle} plan has no open IMPLEMENT tasks ({} consecutive cycles)",
                    state.no_work_cycles
                )],
            )?;
            return Ok(Some(LoopStop::NoRemainingWork { cycle }));
        }

        info!(cycle, "no implementation work planned, skipping to the next cycle");
        self.reporter.info(&format!(
            "cycle {cycle} planned no implementation work, skipping ahead"
        ));
        self.complete_cycle(state, iteration, "no implementation work planned")
    }

    fn finish_cycle(&self, state: &mut SessionState, iteration: u32) -> Result<Option<LoopStop>> {
        state.no_work_cycles = 0;
        self.complete_cycle(state, iteration, "all phases finished")
    }

    fn complete_cycle(
        &self,
        state: &mut SessionState,
        iteration: u32,
        note: &str,
    ) -> Result<Option<LoopStop>> {
        let completed = state.finish_cycle();
        if completed >= self.config.max_cycles {
            state.mark_complete(Utc::now());
            info!(cycles = completed, "workflow complete");
            self.reporter.success(&format!(
                "workflow complete ({completed} cycle(s), {} iterations, ${:.2})",
                state.total_iterations, state.cost_usd
            ));
            self.record(
                iteration,
                "Workflow complete",
                &[format!("cycles: {completed}"), counters_line(state)],
            )?;
            return Ok(Some(LoopStop::Complete { cycles: completed }));
        }

        let mut lines = vec![
            note.to_string(),
            format!("cycles completed: {completed} of {}", self.config.max_cycles),
        ];
        if let Some(archived) = archive_plan(&self.run, completed)? {
            lines.push(format!("plan archived to {}", archived.display()));
        }
        state.restart_cycle();
        lines.push(format!("restarting at {}", state.current_phase));
        self.reporter.info(&format!(
            "cycle {completed} complete, starting cycle {}",
            completed + 1
        ));
        self.record(iteration, &format!("Cycle {completed} complete"), &lines)?;
        Ok(None)
    }

    /// Report plan issues when PLAN exits. They never halt the run.
    fn check_plan(&self, iteration: u32) -> Result<()> {
        let text = read_plan_text(&self.run.plan_path)?;
        let issues = validate_plan(text.as_deref());
        if issues.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = issues.iter().map(ToString::to_string).collect();
        for line in &lines {
            self.reporter.warn(&format!("plan: {line}"));
        }
        self.record(iteration, "Plan validation warnings", &lines)
    }

    fn report_blocked(&self, iteration: u32, blocked: &BlockedDetails) -> Result<()> {
        let mut lines = Vec::new();
        if let Some(reason) = &blocked.reason {
            lines.push(format!("reason: {reason}"));
        }
        if !blocked.resources.is_empty() {
            lines.push(format!("resources: {}", blocked.resources.join(", ")));
        }
        if let Some(resolution) = &blocked.resolution {
            lines.push(format!("resolution: {resolution}"));
        }
        if lines.is_empty() {
            lines.push("no details given".to_string());
        }
        for line in &lines {
            self.reporter.warn(&format!("blocked {line}"));
        }
        self.record(iteration, "Blocked", &lines)
    }

    fn checkpoint(&self, state: &SessionState, iteration: u32) -> Result<()> {
        let interval = self.config.checkpoint_interval;
        if interval == 0 || iteration % interval != 0 {
            return Ok(());
        }
        debug!(iteration, "writing checkpoint");
        self.record(
            iteration,
            "Checkpoint",
            &[
                format!("phase: {}", state.current_phase),
                counters_line(state),
                format!("cost: ${:.2}", state.cost_usd),
            ],
        )
    }

    fn loop_context(&self, state: &SessionState, plan: &PlanDocument) -> Result<LoopContext> {
        let git = self.git.progress(state.starting_commit.as_deref());
        let recent_decisions = self.decisions.recent(RECENT_DECISION_LINES)?;
        let next_wave = match load_structured_plan(&self.run.plan_json_path) {
            Ok(Some(structured)) => match structured.next_wave() {
                Ok(wave) => wave.as_ref().map(WaveSummary::from),
                Err(err) => {
                    warn!(err = %err, "cannot compute plan waves");
                    self.reporter.warn(&format!("plan.json: {err}"));
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(err = %err, "ignoring unusable plan.json");
                self.reporter.warn(&format!("plan.json ignored: {err:#}"));
                None
            }
        };
        Ok(LoopContext {
            cycle: state.cycle + 1,
            completed_cycles: state.cycle,
            total_iterations: state.total_iterations,
            phase_iterations: state.phase_iterations,
            cycle_iterations: state.cycle_iterations,
            tasks_completed: plan.checked_count(),
            cost: format!("{:.2}", state.cost_usd),
            git,
            recent_decisions,
            next_wave,
        })
    }

    fn start_heartbeat(&self) -> Option<Heartbeat> {
        match Heartbeat::start(
            &self.run.path,
            self.reporter.clone(),
            self.config.heartbeat_interval(),
            self.config.stall_timeout(),
        ) {
            Ok(heartbeat) => Some(heartbeat),
            Err(err) => {
                warn!(err = %err, "heartbeat unavailable");
                None
            }
        }
    }

    fn interrupted(&self, state: &mut SessionState) -> Result<LoopStop> {
        warn!("interrupt received, persisting state");
        state.touch(Utc::now());
        self.persist(state)?;
        self.record(
            state.total_iterations,
            "Interrupted",
            &[counters_line(state)],
        )?;
        self.reporter.warn(&format!(
            "interrupted; resume with `phaseloop resume --run-dir {}`",
            self.run.path.display()
        ));
        Ok(LoopStop::Interrupted)
    }

    fn finish_iteration(
        &self,
        paths: &IterationPaths,
        meta: &mut IterationMeta,
        state: &mut SessionState,
        started: Instant,
    ) -> Result<()> {
        state.touch(Utc::now());
        self.persist(state)?;
        self.finish_meta(paths, meta, state, started)
    }

    fn finish_meta(
        &self,
        paths: &IterationPaths,
        meta: &mut IterationMeta,
        state: &SessionState,
        started: Instant,
    ) -> Result<()> {
        meta.ended_at = Utc::now();
        meta.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        meta.total_cost_usd = state.cost_usd;
        write_meta(paths, meta)
    }

    fn persist(&self, state: &SessionState) -> Result<()> {
        save_state(&self.run.state_path, state)
    }

    fn record(&self, iteration: u32, title: &str, lines: &[String]) -> Result<()> {
        self.decisions.record(iteration, title, lines, Utc::now())
    }
}

fn counters_line(state: &SessionState) -> String {
    format!(
        "iterations: total {}, phase {}, cycle {}; no-progress {}, repeated-error {}, test-only {}, blocked {}",
        state.total_iterations,
        state.phase_iterations,
        state.cycle_iterations,
        state.breaker.no_progress_streak,
        state.breaker.repeated_error_streak,
        state.breaker.test_only_streak,
        state.breaker.blocked_streak
    )
}
