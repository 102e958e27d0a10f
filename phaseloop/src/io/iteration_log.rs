//! Per-iteration artifacts under `<run>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::circuit_breaker::TripReason;
use crate::core::phase::Phase;
use crate::core::transition::Transition;

/// Breaker verdict as recorded in `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum BreakerRecord {
    Continue,
    ExitSignal,
    Triggered { reason: TripReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iteration: u32,
    pub cycle: u32,
    pub phase: Phase,
    pub model: String,
    pub cost_usd: f64,
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One-line status summary; absent when the status block was unusable.
    pub status: Option<String>,
    pub breaker: Option<BreakerRecord>,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iteration: u32) -> Self {
        let dir = iterations_dir.join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.txt"),
            dir,
        }
    }
}

/// Record what was sent to the provider, before the call.
pub fn write_prompt(paths: &IterationPaths, system: &str, user: &str) -> Result<()> {
    create_dir(paths)?;
    let contents = format!("# System\n\n{system}\n\n# User\n\n{user}\n");
    write_text(&paths.prompt_path, &contents)
}

/// Record the provider's raw output.
pub fn write_output(paths: &IterationPaths, output: &str) -> Result<()> {
    create_dir(paths)?;
    write_text(&paths.output_path, output)
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    create_dir(paths)?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

fn create_dir(paths: &IterationPaths) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
