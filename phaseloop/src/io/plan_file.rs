//! Plan files inside a run directory.
//!
//! `plan.md` is written by the provider and only read here. A missing plan
//! reads as an empty plan. `plan.json` is optional and must match the embedded
//! JSON Schema before it is trusted.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::plan::PlanDocument;
use crate::core::task_graph::StructuredPlan;
use crate::io::run_dir::RunDir;

const PLAN_SCHEMA: &str = include_str!("schemas/plan.schema.json");

/// Read the plan text, or `None` if no plan has been written yet.
pub fn read_plan_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "plan file not found");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("read plan {}", path.display())),
    }
}

/// Parse the checklist plan; an absent file is an empty plan.
pub fn read_plan(path: &Path) -> Result<PlanDocument> {
    Ok(read_plan_text(path)?
        .map(|text| PlanDocument::parse(&text))
        .unwrap_or_else(PlanDocument::empty))
}

/// Move `plan.md` aside as `plan-cycle-<cycle>.md`. Returns the archive path.
pub fn archive_plan(run: &RunDir, cycle: u32) -> Result<Option<PathBuf>> {
    if !run.plan_path.exists() {
        debug!(cycle, "no plan to archive");
        return Ok(None);
    }
    let target = run.archived_plan_path(cycle);
    fs::rename(&run.plan_path, &target).with_context(|| {
        format!(
            "archive {} to {}",
            run.plan_path.display(),
            target.display()
        )
    })?;
    info!(cycle, path = %target.display(), "archived plan");
    Ok(Some(target))
}

/// Load and validate `plan.json`, or `None` if it does not exist.
pub fn load_structured_plan(path: &Path) -> Result<Option<StructuredPlan>> {
    let Some(raw) = read_plan_text(path)? else {
        return Ok(None);
    };
    let instance: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    validate_schema(&instance, &schema).with_context(|| format!("validate {}", path.display()))?;
    let plan: StructuredPlan = serde_json::from_value(instance)
        .with_context(|| format!("decode {}", path.display()))?;
    debug!(tasks = plan.tasks.len(), "structured plan loaded");
    Ok(Some(plan))
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::core::phase::Phase;
    use crate::core::task_graph::TaskStatus;
    use crate::test_support::sample_plan;

    fn run_dir(root: &Path) -> RunDir {
        let ts = NaiveDate::from_ymd_opt(2026, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("timestamp");
        RunDir::create(root, "phaseloop", ts).expect("run dir")
    }

    #[test]
    fn missing_plan_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = read_plan(&temp.path().join("plan.md")).expect("read");
        assert_eq!(plan, PlanDocument::empty());
    }

    #[test]
    fn existing_plan_is_parsed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.md");
        fs::write(&path, sample_plan()).expect("write");
        let plan = read_plan(&path).expect("read");
        assert!(plan.has_unchecked_tasks(Phase::Implement));
    }

    #[test]
    fn archive_moves_plan_aside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = run_dir(temp.path());
        assert_eq!(archive_plan(&run, 1).expect("archive"), None);

        fs::write(&run.plan_path, sample_plan()).expect("write");
        let archived = archive_plan(&run, 1).expect("archive").expect("path");
        assert!(archived.ends_with("plan-cycle-1.md"));
        assert!(!run.plan_path.exists());
        assert_eq!(fs::read_to_string(archived).expect("read"), sample_plan());
    }

    #[test]
    fn structured_plan_is_validated_and_decoded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        assert!(load_structured_plan(&path).expect("load").is_none());

        fs::write(
            &path,
            r#"{"goal": "cache", "tasks": [
                {"id": "a", "name": "schema"},
                {"id": "b", "name": "store", "depends_on": ["a"], "status": "in_progress"}
            ]}"#,
        )
        .expect("write");
        let plan = load_structured_plan(&path).expect("load").expect("plan");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
        assert_eq!(plan.tasks[1].status, TaskStatus::InProgress);
    }

    #[test]
    fn schema_violations_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, r#"{"tasks": [{"id": "a", "name": "x", "status": "done"}]}"#)
            .expect("write");
        let err = load_structured_plan(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }
}
