//! Phase-driven autonomous coding agent loop.
//!
//! This crate drives an external AI coding agent through a fixed sequence of
//! phases (plan, implement, review, test, final review, commit) one provider
//! call at a time, until the plan is finished or a stop condition fires. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (phase catalog, status codec, plan
//!   tracking, circuit breaker, transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   the provider). Isolated to enable scripted fakes in tests.
//!
//! Orchestration modules ([`orchestrator`], [`start`], [`status`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
