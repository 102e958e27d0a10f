//! Hard ceilings checked before every provider call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_iterations: u32,
    pub cost_limit_usd: f64,
}

/// A ceiling that stops the run, with the counters that reached it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimitBreach {
    Iterations { total: u32, max: u32 },
    Cost { spent_usd: f64, limit_usd: f64 },
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitBreach::Iterations { total, max } => {
                write!(f, "iteration limit reached ({total} of {max} iterations used)")
            }
            LimitBreach::Cost {
                spent_usd,
                limit_usd,
            } => write!(
                f,
                "cost limit reached (${spent_usd:.2} spent, limit ${limit_usd:.2})"
            ),
        }
    }
}

/// Return the first ceiling the next iteration would cross, if any.
///
/// Cost is checked before iterations; both count as reached at equality.
pub fn check(state: &SessionState, limits: &Limits) -> Option<LimitBreach> {
    if state.cost_usd >= limits.cost_limit_usd {
        return Some(LimitBreach::Cost {
            spent_usd: state.cost_usd,
            limit_usd: limits.cost_limit_usd,
        });
    }
    if state.total_iterations >= limits.max_iterations {
        return Some(LimitBreach::Iterations {
            total: state.total_iterations,
            max: limits.max_iterations,
        });
    }
    None
}
