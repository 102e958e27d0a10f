//! Stagnation detection across iterations.
//!
//! The phase-loop guard runs first, even on turns that carry an exit signal:
//! an agent that keeps declaring a loopable phase done without checking its
//! tasks off never leaves that phase. An exit signal otherwise resets every
//! streak. Other turns fold their status into the streak counters and then
//! check blocked, test-only loop, repeated error and no progress, in that
//! order. Updating before checking lets a single turn be the one that reaches
//! the threshold.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::phase::Phase;
use crate::core::session::{BreakerCounters, SessionState};
use crate::core::status_block::{ExecutionStatus, StatusBlock, WorkType};

/// Detector thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive occurrences that trip a stagnation detector.
    pub threshold: u32,
    /// Consecutive iterations a loopable phase may run before tripping.
    pub max_phase_iterations: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            max_phase_iterations: 10,
        }
    }
}

/// Why the breaker halted the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    TestOnlyLoop { iterations: u32 },
    RepeatedError { count: u32, message: String },
    NoProgress { iterations: u32 },
    Blocked { iterations: u32 },
    PhaseLoop { phase: Phase, iterations: u32 },
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::TestOnlyLoop { iterations } => write!(
                f,
                "Test-only loop detected ({iterations} iterations of TESTING with no file changes)"
            ),
            TripReason::RepeatedError { count, message } => write!(
                f,
                "Repeated error detected (same error pattern {count} times): {message}"
            ),
            TripReason::NoProgress { iterations } => write!(
                f,
                "No progress detected for {iterations} iterations (0 tasks completed, 0 files modified)"
            ),
            TripReason::Blocked { iterations } => {
                write!(f, "Blocked for {iterations} consecutive iterations")
            }
            TripReason::PhaseLoop { phase, iterations } => write!(
                f,
                "{phase} ran {iterations} consecutive iterations without advancing"
            ),
        }
    }
}

/// Verdict for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// Keep iterating.
    Continue,
    /// The provider declared the turn's work done.
    ExitSignal,
    /// Halt the run and surface the reason.
    Triggered(TripReason),
}

/// Fold `status` into the session's counters and decide whether to halt.
///
/// An exit signal resets every streak and bypasses the stagnation detectors,
/// but not the phase-loop guard.
pub fn evaluate(
    state: &mut SessionState,
    status: &StatusBlock,
    config: &BreakerConfig,
) -> BreakerOutcome {
    if state.current_phase.can_loop()
        && config.max_phase_iterations > 0
        && state.phase_iterations >= config.max_phase_iterations
    {
        return BreakerOutcome::Triggered(TripReason::PhaseLoop {
            phase: state.current_phase,
            iterations: state.phase_iterations,
        });
    }

    if status.exit_signal {
        debug!("exit signal observed, resetting breaker counters");
        state.breaker = BreakerCounters::default();
        return BreakerOutcome::ExitSignal;
    }

    let counters = &mut state.breaker;
    update_counters(counters, status);
    debug!(
        test_only = counters.test_only_streak,
        repeated_error = counters.repeated_error_streak,
        no_progress = counters.no_progress_streak,
        blocked = counters.blocked_streak,
        "breaker counters updated"
    );

    let threshold = config.threshold.max(1);
    if counters.blocked_streak >= threshold {
        return BreakerOutcome::Triggered(TripReason::Blocked {
            iterations: counters.blocked_streak,
        });
    }
    if counters.test_only_streak >= threshold {
        return BreakerOutcome::Triggered(TripReason::TestOnlyLoop {
            iterations: counters.test_only_streak,
        });
    }
    if counters.repeated_error_streak >= threshold {
        return BreakerOutcome::Triggered(TripReason::RepeatedError {
            count: counters.repeated_error_streak,
            message: counters.last_error_message.clone().unwrap_or_default(),
        });
    }
    if counters.no_progress_streak >= threshold {
        return BreakerOutcome::Triggered(TripReason::NoProgress {
            iterations: counters.no_progress_streak,
        });
    }
    BreakerOutcome::Continue
}

fn update_counters(counters: &mut BreakerCounters, status: &StatusBlock) {
    if status.work_type == WorkType::Testing && status.files_modified == 0 {
        counters.test_only_streak += 1;
    } else {
        counters.test_only_streak = 0;
    }

    if signals_error(status) {
        if counters.last_error_message.as_deref() == Some(status.recommendation.as_str()) {
            counters.repeated_error_streak += 1;
        } else {
            counters.last_error_message = Some(status.recommendation.clone());
            counters.repeated_error_streak = 1;
        }
    } else {
        counters.last_error_message = None;
        counters.repeated_error_streak = 0;
    }

    if status.made_no_progress() {
        counters.no_progress_streak += 1;
    } else {
        counters.no_progress_streak = 0;
    }

    if status.status == ExecutionStatus::Blocked {
        counters.blocked_streak += 1;
    } else {
        counters.blocked_streak = 0;
    }
}

/// Substring heuristic: "error" in the recommendation or "blocked" in the status.
fn signals_error(status: &StatusBlock) -> bool {
    status.recommendation.to_lowercase().contains("error")
        || status.status.as_str().to_lowercase().contains("blocked")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::phase::Mode;
    use crate::test_support::StatusBlockBuilder;

    fn state() -> SessionState {
        SessionState::new("task", Mode::Standard, None, Utc::now())
    }

    fn run(state: &mut SessionState, status: &StatusBlock) -> BreakerOutcome {
        evaluate(state, status, &BreakerConfig::default())
    }

    #[test]
    fn exit_signal_wins_and_resets_counters() {
        let mut state = state();
        let idle = StatusBlockBuilder::new().build();
        assert_eq!(run(&mut state, &idle), BreakerOutcome::Continue);
        assert_eq!(run(&mut state, &idle), BreakerOutcome::Continue);

        let done = StatusBlockBuilder::new().exit_signal(true).build();
        assert_eq!(run(&mut state, &done), BreakerOutcome::ExitSignal);
        assert_eq!(state.breaker, BreakerCounters::default());
    }

    #[test]
    fn third_idle_turn_trips_no_progress() {
        let mut state = state();
        let idle = StatusBlockBuilder::new().build();
        assert_eq!(run(&mut state, &idle), BreakerOutcome::Continue);
        assert_eq!(run(&mut state, &idle), BreakerOutcome::Continue);
        assert_eq!(
            run(&mut state, &idle),
            BreakerOutcome::Triggered(TripReason::NoProgress { iterations: 3 })
        );
    }

    #[test]
    fn progress_resets_the_no_progress_streak() {
        let mut state = state();
        let idle = StatusBlockBuilder::new().build();
        run(&mut state, &idle);
        run(&mut state, &idle);
        let busy = StatusBlockBuilder::new().files_modified(2).build();
        assert_eq!(run(&mut state, &busy), BreakerOutcome::Continue);
        assert_eq!(state.breaker.no_progress_streak, 0);
        assert_eq!(run(&mut state, &idle), BreakerOutcome::Continue);
    }

    /// Test-only turns that complete tasks still count, and outrank no-progress.
    #[test]
    fn three_testing_turns_without_file_changes_trip() {
        let mut state = state();
        let testing = StatusBlockBuilder::new()
            .work_type(WorkType::Testing)
            .tasks_completed(1)
            .build();
        assert_eq!(run(&mut state, &testing), BreakerOutcome::Continue);
        assert_eq!(run(&mut state, &testing), BreakerOutcome::Continue);
        assert_eq!(
            run(&mut state, &testing),
            BreakerOutcome::Triggered(TripReason::TestOnlyLoop { iterations: 3 })
        );
    }

    #[test]
    fn a_non_testing_turn_resets_the_test_only_streak() {
        let mut state = state();
        let testing = StatusBlockBuilder::new()
            .work_type(WorkType::Testing)
            .tasks_completed(1)
            .build();
        let coding = StatusBlockBuilder::new().tasks_completed(1).build();
        run(&mut state, &testing);
        run(&mut state, &testing);
        assert_eq!(run(&mut state, &coding), BreakerOutcome::Continue);
        assert_eq!(state.breaker.test_only_streak, 0);
        assert_eq!(run(&mut state, &testing), BreakerOutcome::Continue);
    }

    #[test]
    fn identical_error_text_three_times_trips() {
        let mut state = state();
        let failing = StatusBlockBuilder::new()
            .files_modified(1)
            .recommendation("Build error in parser.rs")
            .build();
        assert_eq!(run(&mut state, &failing), BreakerOutcome::Continue);
        assert_eq!(run(&mut state, &failing), BreakerOutcome::Continue);
        assert_eq!(
            run(&mut state, &failing),
            BreakerOutcome::Triggered(TripReason::RepeatedError {
                count: 3,
                message: "Build error in parser.rs".to_string(),
            })
        );
    }

    #[test]
    fn changed_error_text_restarts_the_streak_at_one() {
        let mut state = state();
        let first = StatusBlockBuilder::new()
            .files_modified(1)
            .recommendation("Error: missing import")
            .build();
        let second = StatusBlockBuilder::new()
            .files_modified(1)
            .recommendation("Error: type mismatch")
            .build();
        run(&mut state, &first);
        run(&mut state, &first);
        assert_eq!(run(&mut state, &second), BreakerOutcome::Continue);
        assert_eq!(state.breaker.repeated_error_streak, 1);
        assert_eq!(
            state.breaker.last_error_message.as_deref(),
            Some("Error: type mismatch")
        );

        let clean = StatusBlockBuilder::new().files_modified(1).build();
        run(&mut state, &clean);
        assert_eq!(state.breaker.repeated_error_streak, 0);
        assert_eq!(state.breaker.last_error_message, None);
    }

    /// Blocked turns also feed the repeated-error streak, but the blocked
    /// detector is checked first.
    #[test]
    fn identical_blocked_turns_halt_as_blocked() {
        let mut state = state();
        let blocked = StatusBlockBuilder::new()
            .blocked("need credentials")
            .files_modified(1)
            .recommendation("Waiting on credentials")
            .build();
        run(&mut state, &blocked);
        run(&mut state, &blocked);
        assert_eq!(
            run(&mut state, &blocked),
            BreakerOutcome::Triggered(TripReason::Blocked { iterations: 3 })
        );
        assert_eq!(state.breaker.repeated_error_streak, 3);
    }

    #[test]
    fn repeated_error_counts_a_blocked_turn_with_the_same_text() {
        let mut state = state();
        let failing = StatusBlockBuilder::new()
            .files_modified(1)
            .recommendation("Error: cannot reach the registry")
            .build();
        let blocked = StatusBlockBuilder::new()
            .blocked("registry down")
            .files_modified(1)
            .recommendation("Error: cannot reach the registry")
            .build();
        run(&mut state, &failing);
        run(&mut state, &blocked);
        assert!(matches!(
            run(&mut state, &blocked),
            BreakerOutcome::Triggered(TripReason::RepeatedError { count: 3, .. })
        ));
        assert_eq!(state.breaker.blocked_streak, 2);
    }

    #[test]
    fn varied_blocked_turns_trip_the_blocked_detector() {
        let mut state = state();
        for (idx, text) in ["need db", "need key", "need vpn"].iter().enumerate() {
            let blocked = StatusBlockBuilder::new()
                .blocked(text)
                .files_modified(1)
                .recommendation(text)
                .build();
            let outcome = run(&mut state, &blocked);
            if idx < 2 {
                assert_eq!(outcome, BreakerOutcome::Continue);
            } else {
                assert_eq!(
                    outcome,
                    BreakerOutcome::Triggered(TripReason::Blocked { iterations: 3 })
                );
            }
        }
    }

    #[test]
    fn long_stays_in_a_loopable_phase_trip() {
        let mut state = state();
        state.enter_phase(Phase::Review);
        let busy = StatusBlockBuilder::new().files_modified(1).build();
        for _ in 0..9 {
            state.begin_iteration();
            assert_eq!(run(&mut state, &busy), BreakerOutcome::Continue);
        }
        state.begin_iteration();
        assert_eq!(
            run(&mut state, &busy),
            BreakerOutcome::Triggered(TripReason::PhaseLoop {
                phase: Phase::Review,
                iterations: 10
            })
        );
    }

    /// Declaring REVIEW done every turn without checking its tasks off still
    /// trips the guard.
    #[test]
    fn phase_loop_guard_ignores_exit_signals() {
        let mut state = state();
        state.enter_phase(Phase::Review);
        let done = StatusBlockBuilder::new()
            .exit_signal(true)
            .files_modified(1)
            .build();
        for _ in 0..9 {
            state.begin_iteration();
            assert_eq!(run(&mut state, &done), BreakerOutcome::ExitSignal);
        }
        state.begin_iteration();
        assert_eq!(
            run(&mut state, &done),
            BreakerOutcome::Triggered(TripReason::PhaseLoop {
                phase: Phase::Review,
                iterations: 10
            })
        );
    }

    #[test]
    fn non_loopable_phases_have_no_iteration_guard() {
        let mut state = state();
        state.enter_phase(Phase::Implement);
        let done = StatusBlockBuilder::new()
            .exit_signal(true)
            .files_modified(1)
            .build();
        for _ in 0..12 {
            state.begin_iteration();
            assert_eq!(run(&mut state, &done), BreakerOutcome::ExitSignal);
        }
    }

    #[test]
    fn reasons_read_like_operator_messages() {
        assert_eq!(
            TripReason::NoProgress { iterations: 3 }.to_string(),
            "No progress detected for 3 iterations (0 tasks completed, 0 files modified)"
        );
        assert!(
            TripReason::TestOnlyLoop { iterations: 3 }
                .to_string()
                .starts_with("Test-only loop detected")
        );
    }
}
