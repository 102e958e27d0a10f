//! Persisted session aggregate for one run.
//!
//! Only the workflow owns a [`SessionState`]. The circuit breaker and the
//! transition logic receive it by reference and touch their own counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::phase::{Mode, Phase, starting_phase};

/// Stagnation streaks maintained by the circuit breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerCounters {
    pub no_progress_streak: u32,
    pub repeated_error_streak: u32,
    pub last_error_message: Option<String>,
    pub test_only_streak: u32,
    pub blocked_streak: u32,
}

/// Everything needed to resume a run after the process exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Original task prompt.
    pub prompt: String,
    pub mode: Mode,
    /// HEAD when the run started, if the project is a git repository.
    pub starting_commit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the final cycle reaches DONE.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub current_phase: Phase,
    pub phase_name: String,
    /// Completed workflow cycles.
    pub cycle: u32,
    pub total_iterations: u32,
    pub phase_iterations: u32,
    pub cycle_iterations: u32,
    pub cost_usd: f64,
    #[serde(default)]
    pub breaker: BreakerCounters,
    #[serde(default)]
    pub no_work_cycles: u32,
    #[serde(default)]
    pub exit_signal_received: bool,
}

impl SessionState {
    pub fn new(
        prompt: impl Into<String>,
        mode: Mode,
        starting_commit: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let phase = starting_phase(mode);
        Self {
            prompt: prompt.into(),
            mode,
            starting_commit,
            started_at: now,
            updated_at: now,
            completed_at: None,
            current_phase: phase,
            phase_name: phase.name().to_string(),
            cycle: 0,
            total_iterations: 0,
            phase_iterations: 0,
            cycle_iterations: 0,
            cost_usd: 0.0,
            breaker: BreakerCounters::default(),
            no_work_cycles: 0,
            exit_signal_received: false,
        }
    }

    /// Count a new provider call and return its 1-indexed iteration number.
    pub fn begin_iteration(&mut self) -> u32 {
        self.total_iterations += 1;
        self.phase_iterations += 1;
        self.cycle_iterations += 1;
        self.total_iterations
    }

    /// Accumulate provider cost. Negative or non-finite amounts are ignored.
    pub fn add_cost(&mut self, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            self.cost_usd += usd;
        }
    }

    /// Switch phase and restart the per-phase counter.
    pub fn enter_phase(&mut self, phase: Phase) {
        self.current_phase = phase;
        self.phase_name = phase.name().to_string();
        self.phase_iterations = 0;
    }

    /// Record a finished cycle and return the number of completed cycles.
    pub fn finish_cycle(&mut self) -> u32 {
        self.cycle += 1;
        self.cycle
    }

    /// Start the next cycle from the mode's starting phase.
    pub fn restart_cycle(&mut self) {
        self.enter_phase(starting_phase(self.mode));
        self.cycle_iterations = 0;
        self.exit_signal_received = false;
    }

    pub fn mark_complete(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.touch(now);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
