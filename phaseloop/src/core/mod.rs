//! Deterministic, pure workflow logic.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod circuit_breaker;
pub mod limits;
pub mod phase;
pub mod plan;
pub mod plan_validation;
pub mod session;
pub mod status_block;
pub mod task_graph;
pub mod transition;
