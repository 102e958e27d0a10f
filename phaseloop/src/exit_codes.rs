//! Stable exit codes for the `phaseloop` binary.

use crate::error::{PhaseloopError, ProtocolError, ProviderError, StateError};

/// Run completed (every cycle reached DONE, or no work remained).
pub const OK: i32 = 0;
/// Invalid configuration or usage, or an unexpected I/O failure.
pub const INVALID: i32 = 1;
/// The circuit breaker halted the run.
pub const CIRCUIT_BREAKER: i32 = 2;
/// The iteration ceiling or the cost ceiling was reached.
pub const LIMIT: i32 = 3;
/// The provider's status block was missing or malformed.
pub const PROTOCOL: i32 = 4;
/// The provider failed with a non-retryable error or exhausted its retries.
pub const PROVIDER: i32 = 5;
/// Resume was requested but there is no run or no state file.
pub const NOTHING_TO_RESUME: i32 = 6;
/// Resume was requested but the state file is damaged.
pub const CORRUPT_STATE: i32 = 7;
/// The operator interrupted the run.
pub const INTERRUPTED: i32 = 130;

/// Map a fatal error to its exit code by walking the error chain.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<PhaseloopError>() {
            match err {
                PhaseloopError::Protocol { .. } => return PROTOCOL,
                PhaseloopError::Provider { .. } => return PROVIDER,
                PhaseloopError::State(state) => return for_state_error(state),
                PhaseloopError::Other(_) => {}
            }
        }
        if let Some(state) = cause.downcast_ref::<StateError>() {
            return for_state_error(state);
        }
        if cause.downcast_ref::<ProtocolError>().is_some() {
            return PROTOCOL;
        }
        if cause.downcast_ref::<ProviderError>().is_some() {
            return PROVIDER;
        }
    }
    INVALID
}

fn for_state_error(err: &StateError) -> i32 {
    match err {
        StateError::Missing { .. } => NOTHING_TO_RESUME,
        StateError::Corrupt { .. } => CORRUPT_STATE,
    }
}
