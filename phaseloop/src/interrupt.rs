//! Operator interrupt (Ctrl-C) handling.
//!
//! The first Ctrl-C only raises a flag; the workflow notices it between steps,
//! persists the session state and stops with a distinct exit code. A second
//! Ctrl-C exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::exit_codes;

/// Shared "stop as soon as it is safe" flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Install a Ctrl-C listener that raises `flag`.
///
/// The listener runs a current-thread tokio runtime on its own thread so the
/// blocking workflow loop stays synchronous.
pub fn install_ctrl_c_handler(flag: InterruptFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    thread::Builder::new()
        .name("phaseloop-ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(err = %err, "ctrl-c listener failed");
                        return;
                    }
                    if flag.is_set() {
                        std::process::exit(exit_codes::INTERRUPTED);
                    }
                    warn!("interrupt received, stopping after the current step");
                    flag.trigger();
                }
            });
        })
        .context("spawn ctrl-c listener")?;
    debug!("ctrl-c handler installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_flag() {
        let flag = InterruptFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.trigger();
        assert!(clone.is_set());
    }
}
