//! Typed errors the loop and the binary need to tell apart.
//!
//! Plumbing failures travel as `anyhow::Error`; the variants here are the ones
//! that change what the operator sees (distinct exit codes, distinct messages).

use std::path::PathBuf;

use thiserror::Error;

/// The provider's status block could not be extracted or understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("status block start marker `{marker}` not found in provider output")]
    MissingStartMarker { marker: String },

    #[error("status block end marker `{marker}` not found in provider output")]
    MissingEndMarker { marker: String },

    #[error("status block missing required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<String> },

    #[error("invalid {field} value `{value}` (expected one of {expected})")]
    InvalidValue {
        field: &'static str,
        value: String,
        expected: String,
    },
}

/// A failed provider call, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub retryable: bool,
    /// Spend reported by the backend before the call failed.
    pub cost_usd: Option<f64>,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            cost_usd: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            cost_usd: None,
        }
    }

    /// The operator asked the run to stop; never retried.
    pub fn interrupted() -> Self {
        Self::fatal("provider call abandoned: interrupted by operator")
    }

    pub fn with_cost(mut self, cost_usd: Option<f64>) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Persisted session state could not be used for a resume.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("nothing to resume: no session state at {}", .path.display())]
    Missing { path: PathBuf },

    #[error("session state at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Dependency waves could not be computed for a structured plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaveError {
    #[error("duplicate task id `{0}`")]
    DuplicateId(String),

    #[error("dependency cycle among tasks: {}", .task_ids.join(", "))]
    Cycle { task_ids: Vec<String> },
}

/// Fatal errors raised by the workflow loop.
#[derive(Debug, Error)]
pub enum PhaseloopError {
    #[error("iteration {iteration}: {source}")]
    Protocol {
        iteration: u32,
        #[source]
        source: ProtocolError,
    },

    #[error("iteration {iteration}: provider failed: {source}")]
    Provider {
        iteration: u32,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
