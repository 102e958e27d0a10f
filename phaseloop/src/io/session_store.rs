//! Session state storage (`<run>/state.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::session::SessionState;
use crate::error::StateError;

/// Load session state, telling "no state" apart from "damaged state".
pub fn load_state(path: &Path) -> Result<SessionState, StateError> {
    debug!(path = %path.display(), "loading session state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StateError::Missing {
                path: path.to_path_buf(),
            });
        }
        Err(err) => {
            return Err(StateError::Corrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            });
        }
    };
    let state: SessionState =
        serde_json::from_str(&contents).map_err(|err| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    debug!(
        total_iterations = state.total_iterations,
        phase = state.current_phase.name(),
        "session state loaded"
    );
    Ok(state)
}

/// Atomically write session state to disk (temp file + rename).
pub fn save_state(path: &Path, state: &SessionState) -> Result<()> {
    debug!(
        path = %path.display(),
        total_iterations = state.total_iterations,
        phase = state.current_phase.name(),
        "writing session state"
    );
    let mut buf = serde_json::to_string_pretty(state).context("serialize session state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::core::phase::{Mode, Phase};

    /// Verifies save → discard → load preserves every field.
    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let started = Utc
            .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
            .single()
            .expect("valid time");

        let mut state = SessionState::new("add caching", Mode::Comprehensive, Some("abc123".into()), started);
        state.begin_iteration();
        state.begin_iteration();
        state.enter_phase(Phase::Test);
        state.begin_iteration();
        state.add_cost(0.1);
        state.add_cost(0.2);
        state.breaker.repeated_error_streak = 2;
        state.breaker.last_error_message = Some("Error: flaky".to_string());
        state.breaker.no_progress_streak = 1;
        state.breaker.blocked_streak = 1;
        state.cycle = 1;
        state.no_work_cycles = 1;
        state.exit_signal_received = true;
        state.touch(Utc::now());

        save_state(&path, &state).expect("save");
        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded, state);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_is_missing_not_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_state(&temp.path().join("state.json")).unwrap_err();
        assert!(matches!(err, StateError::Missing { .. }));
    }

    #[test]
    fn garbage_is_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{\"prompt\": \"half").expect("write");
        let err = load_state(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn phase_is_stored_by_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut state = SessionState::new("task", Mode::Standard, None, Utc::now());
        state.enter_phase(Phase::FinalReview);
        save_state(&path, &state).expect("save");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"current_phase\": \"FINAL_REVIEW\""));
        assert!(raw.contains("\"phase_name\": \"FINAL-REVIEW\""));
    }
}
