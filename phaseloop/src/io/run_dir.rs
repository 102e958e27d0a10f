//! Run directories: one timestamped directory per orchestrator invocation.
//!
//! Layout of `<runs_dir>/<prefix>-<YYYYMMDD-HHMMSS>/`:
//!
//! ```text
//! state.json        persisted session state
//! plan.md           checklist plan written by the provider
//! plan.json         optional structured plan
//! decisions.md      append-only decision log
//! last_output.txt   raw output of the most recent provider call
//! iterations/<n>/   per-iteration prompt, output and metadata
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDateTime;
use regex::Regex;
use tracing::{debug, info};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Canonical paths within one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub id: String,
    pub path: PathBuf,
    pub state_path: PathBuf,
    pub plan_path: PathBuf,
    pub plan_json_path: PathBuf,
    pub decisions_path: PathBuf,
    pub last_output_path: PathBuf,
    pub iterations_dir: PathBuf,
}

/// `<prefix>-<YYYYMMDD-HHMMSS>` for the given local time.
pub fn run_id_for(prefix: &str, timestamp: NaiveDateTime) -> String {
    format!("{prefix}-{}", timestamp.format(TIMESTAMP_FORMAT))
}

impl RunDir {
    fn at(path: PathBuf) -> Self {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id,
            state_path: path.join("state.json"),
            plan_path: path.join("plan.md"),
            plan_json_path: path.join("plan.json"),
            decisions_path: path.join("decisions.md"),
            last_output_path: path.join("last_output.txt"),
            iterations_dir: path.join("iterations"),
            path,
        }
    }

    /// Create a fresh run directory. Fails if one with the same id exists.
    pub fn create(runs_dir: &Path, prefix: &str, timestamp: NaiveDateTime) -> Result<Self> {
        fs::create_dir_all(runs_dir)
            .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
        let path = runs_dir.join(run_id_for(prefix, timestamp));
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(anyhow!("run directory {} already exists", path.display()));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create run dir {}", path.display()));
            }
        }
        let run = Self::at(path);
        fs::create_dir_all(&run.iterations_dir)
            .with_context(|| format!("create {}", run.iterations_dir.display()))?;
        info!(run_id = %run.id, path = %run.path.display(), "created run directory");
        Ok(run)
    }

    /// Open an existing run directory whose name carries `prefix`.
    pub fn open(path: &Path, prefix: &str) -> Result<Self> {
        if !path.is_dir() {
            return Err(anyhow!("run directory {} does not exist", path.display()));
        }
        let run = Self::at(path.to_path_buf());
        if !run.id.starts_with(&format!("{prefix}-")) {
            return Err(anyhow!(
                "{} is not a run directory (expected a name starting with `{prefix}-`)",
                path.display()
            ));
        }
        Ok(run)
    }

    /// Most recent run under `runs_dir`, by timestamped name.
    pub fn find_last(runs_dir: &Path, prefix: &str) -> Result<Option<Self>> {
        if !runs_dir.is_dir() {
            debug!(runs_dir = %runs_dir.display(), "no runs directory");
            return Ok(None);
        }
        let pattern = Regex::new(&format!(r"^{}-\d{{8}}-\d{{6}}$", regex::escape(prefix)))
            .context("build run name pattern")?;
        let mut names = Vec::new();
        for entry in
            fs::read_dir(runs_dir).with_context(|| format!("read {}", runs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", runs_dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if pattern.is_match(&name) && entry.path().is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.pop().map(|name| Self::at(runs_dir.join(name))))
    }

    /// Where `plan.md` is archived when `cycle` completes.
    pub fn archived_plan_path(&self, cycle: u32) -> PathBuf {
        self.path.join(format!("plan-cycle-{cycle}.md"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts(hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .and_then(|d| d.and_hms_opt(hour, min, sec))
            .expect("valid timestamp")
    }

    #[test]
    fn run_id_uses_prefix_and_timestamp() {
        assert_eq!(run_id_for("phaseloop", ts(9, 5, 7)), "phaseloop-20260314-090507");
    }

    #[test]
    fn create_builds_layout_and_refuses_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path().join("runs");
        let run = RunDir::create(&runs, "phaseloop", ts(10, 0, 0)).expect("create");
        assert_eq!(run.id, "phaseloop-20260314-100000");
        assert!(run.iterations_dir.is_dir());
        assert!(run.state_path.ends_with("phaseloop-20260314-100000/state.json"));

        let err = RunDir::create(&runs, "phaseloop", ts(10, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn find_last_picks_latest_matching_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path();
        RunDir::create(runs, "phaseloop", ts(8, 0, 0)).expect("create");
        RunDir::create(runs, "phaseloop", ts(11, 30, 0)).expect("create");
        RunDir::create(runs, "other", ts(23, 0, 0)).expect("create");
        fs::create_dir(runs.join("phaseloop-notes")).expect("mkdir");

        let last = RunDir::find_last(runs, "phaseloop")
            .expect("find")
            .expect("some run");
        assert_eq!(last.id, "phaseloop-20260314-113000");
    }

    #[test]
    fn find_last_without_runs_dir_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            RunDir::find_last(&temp.path().join("missing"), "phaseloop").expect("find"),
            None
        );
    }

    #[test]
    fn open_validates_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunDir::create(temp.path(), "phaseloop", ts(1, 2, 3)).expect("create");
        assert_eq!(RunDir::open(&run.path, "phaseloop").expect("open"), run);
        assert!(RunDir::open(&run.path, "other").is_err());
        assert!(RunDir::open(&temp.path().join("nope"), "phaseloop").is_err());
    }
}
