//! Fixed catalog of workflow phases and the default forward edges between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A workflow stage. Discriminants are the phase numbers used in plan headers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Discover = 0,
    Plan = 1,
    Implement = 2,
    Review = 3,
    Test = 4,
    FinalReview = 5,
    Commit = 6,
    Roadmap = 7,
}

/// Which configured model a phase runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Plan,
    Review,
    Default,
}

/// Workflow breadth: standard runs phases 1-6, comprehensive adds 0 and 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Standard,
    Comprehensive,
}

impl Mode {
    pub fn is_comprehensive(self) -> bool {
        self == Mode::Comprehensive
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Standard => "standard",
            Mode::Comprehensive => "comprehensive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Mode::Standard),
            "comprehensive" => Some(Mode::Comprehensive),
            _ => None,
        }
    }

    /// Phases visited by this mode, in order.
    pub fn phases(self) -> &'static [Phase] {
        match self {
            Mode::Standard => &Phase::ALL[1..7],
            Mode::Comprehensive => &Phase::ALL,
        }
    }
}

/// Static metadata for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInfo {
    pub phase: Phase,
    pub name: &'static str,
    pub can_loop: bool,
    pub tier: ModelTier,
    pub completion_check: &'static str,
}

const CATALOG: [PhaseInfo; 8] = [
    PhaseInfo {
        phase: Phase::Discover,
        name: "DISCOVER",
        can_loop: false,
        tier: ModelTier::Plan,
        completion_check: "codebase research recorded in the decision log",
    },
    PhaseInfo {
        phase: Phase::Plan,
        name: "PLAN",
        can_loop: false,
        tier: ModelTier::Plan,
        completion_check: "plan written with tasks for every phase",
    },
    PhaseInfo {
        phase: Phase::Implement,
        name: "IMPLEMENT",
        can_loop: false,
        tier: ModelTier::Default,
        completion_check: "all Phase 2 tasks checked",
    },
    PhaseInfo {
        phase: Phase::Review,
        name: "REVIEW",
        can_loop: true,
        tier: ModelTier::Review,
        completion_check: "all Phase 3 tasks checked, including added fix tasks",
    },
    PhaseInfo {
        phase: Phase::Test,
        name: "TEST",
        can_loop: true,
        tier: ModelTier::Default,
        completion_check: "all Phase 4 tasks checked and tests passing",
    },
    PhaseInfo {
        phase: Phase::FinalReview,
        name: "FINAL-REVIEW",
        can_loop: true,
        tier: ModelTier::Review,
        completion_check: "all Phase 5 tasks checked with no new findings",
    },
    PhaseInfo {
        phase: Phase::Commit,
        name: "COMMIT",
        can_loop: false,
        tier: ModelTier::Default,
        completion_check: "remaining changes committed",
    },
    PhaseInfo {
        phase: Phase::Roadmap,
        name: "ROADMAP",
        can_loop: false,
        tier: ModelTier::Plan,
        completion_check: "follow-up work documented",
    },
];

/// Result of following a phase's default forward edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Phase(Phase),
    Done,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Discover,
        Phase::Plan,
        Phase::Implement,
        Phase::Review,
        Phase::Test,
        Phase::FinalReview,
        Phase::Commit,
        Phase::Roadmap,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(number: u8) -> Option<Phase> {
        Phase::ALL.get(usize::from(number)).copied()
    }

    pub fn info(self) -> &'static PhaseInfo {
        &CATALOG[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn can_loop(self) -> bool {
        self.info().can_loop
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {} ({})", self.number(), self.name())
    }
}

/// Phase a fresh run (or a new cycle) starts in.
pub fn starting_phase(mode: Mode) -> Phase {
    if mode.is_comprehensive() {
        Phase::Discover
    } else {
        Phase::Plan
    }
}

/// Default forward edge. Looping and backward moves are layered on top by
/// [`crate::core::transition`].
pub fn advance(phase: Phase, mode: Mode) -> Next {
    match phase {
        Phase::Discover => Next::Phase(Phase::Plan),
        Phase::Plan => Next::Phase(Phase::Implement),
        Phase::Implement => Next::Phase(Phase::Review),
        Phase::Review => Next::Phase(Phase::Test),
        Phase::Test => Next::Phase(Phase::FinalReview),
        Phase::FinalReview => Next::Phase(Phase::Commit),
        Phase::Commit if mode.is_comprehensive() => Next::Phase(Phase::Roadmap),
        Phase::Commit | Phase::Roadmap => Next::Done,
    }
}
