//! Phase transitions layered on top of the default forward edges.
//!
//! Nothing moves unless the provider raised its exit signal. A loopable phase
//! then stays put while its plan section has unchecked tasks, except FINAL
//! REVIEW, which sends the run back to TEST so fixes get re-verified.

use serde::{Deserialize, Serialize};

use crate::core::phase::{Mode, Next, Phase, advance};
use crate::core::plan::PlanDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "phase", rename_all = "snake_case")]
pub enum Transition {
    /// Run another iteration in the current phase.
    Stay,
    /// Switch to another phase (forward or backward).
    Enter(Phase),
    /// The workflow cycle is finished.
    Done,
}

/// Decide where the workflow goes after a turn in `current`.
pub fn next_transition(
    current: Phase,
    exit_signal: bool,
    plan: &PlanDocument,
    mode: Mode,
) -> Transition {
    if !exit_signal {
        return Transition::Stay;
    }
    if current.can_loop() && plan.has_unchecked_tasks(current) {
        return match current {
            Phase::FinalReview => Transition::Enter(Phase::Test),
            _ => Transition::Stay,
        };
    }
    match advance(current, mode) {
        Next::Phase(next) => Transition::Enter(next),
        Next::Done => Transition::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CHECKED: &str = "\
## Phase 1: PLAN
- [x] plan
## Phase 2: IMPLEMENT
- [x] build
## Phase 3: REVIEW
- [x] review
## Phase 4: TEST
- [x] test
## Phase 5: FINAL-REVIEW
- [x] final pass
## Phase 6: COMMIT
- [x] commit
";

    const NONE_CHECKED: &str = "\
## Phase 1: PLAN
- [ ] plan
## Phase 2: IMPLEMENT
- [ ] build
## Phase 3: REVIEW
- [ ] review
## Phase 4: TEST
- [ ] test
## Phase 5: FINAL-REVIEW
- [ ] final pass
## Phase 6: COMMIT
- [ ] commit
";

    #[test]
    fn without_exit_signal_nothing_moves() {
        for text in [ALL_CHECKED, NONE_CHECKED] {
            let plan = PlanDocument::parse(text);
            for mode in [Mode::Standard, Mode::Comprehensive] {
                for phase in Phase::ALL {
                    assert_eq!(
                        next_transition(phase, false, &plan, mode),
                        Transition::Stay,
                        "{phase} moved without exit signal"
                    );
                }
            }
        }
    }

    #[test]
    fn checked_loopable_phases_advance() {
        let plan = PlanDocument::parse(ALL_CHECKED);
        let cases = [
            (Phase::Review, Phase::Test),
            (Phase::Test, Phase::FinalReview),
            (Phase::FinalReview, Phase::Commit),
        ];
        for (from, to) in cases {
            assert_eq!(
                next_transition(from, true, &plan, Mode::Standard),
                Transition::Enter(to)
            );
        }
    }

    #[test]
    fn unchecked_review_and_test_loop() {
        let plan = PlanDocument::parse(NONE_CHECKED);
        assert_eq!(
            next_transition(Phase::Review, true, &plan, Mode::Standard),
            Transition::Stay
        );
        assert_eq!(
            next_transition(Phase::Test, true, &plan, Mode::Standard),
            Transition::Stay
        );
    }

    #[test]
    fn unchecked_final_review_goes_back_to_test() {
        let plan = PlanDocument::parse(NONE_CHECKED);
        assert_eq!(
            next_transition(Phase::FinalReview, true, &plan, Mode::Standard),
            Transition::Enter(Phase::Test)
        );
    }

    /// Non-loopable phases advance even with unchecked tasks in their section.
    #[test]
    fn non_loopable_phases_always_advance() {
        let plan = PlanDocument::parse(NONE_CHECKED);
        let cases = [
            (Phase::Discover, Transition::Enter(Phase::Plan)),
            (Phase::Plan, Transition::Enter(Phase::Implement)),
            (Phase::Implement, Transition::Enter(Phase::Review)),
            (Phase::Commit, Transition::Done),
        ];
        for (from, expected) in cases {
            assert_eq!(next_transition(from, true, &plan, Mode::Standard), expected);
        }
    }

    #[test]
    fn commit_continues_to_roadmap_in_comprehensive_mode() {
        let plan = PlanDocument::empty();
        assert_eq!(
            next_transition(Phase::Commit, true, &plan, Mode::Comprehensive),
            Transition::Enter(Phase::Roadmap)
        );
        assert_eq!(
            next_transition(Phase::Roadmap, true, &plan, Mode::Comprehensive),
            Transition::Done
        );
    }

    #[test]
    fn missing_plan_lets_loopable_phases_advance() {
        let plan = PlanDocument::empty();
        assert_eq!(
            next_transition(Phase::Test, true, &plan, Mode::Standard),
            Transition::Enter(Phase::FinalReview)
        );
    }
}
