//! Append-only decision log (`<run>/decisions.md`).
//!
//! The provider is told to log its own decisions here too, so entries written
//! by the workflow use the same `## [Iteration N] ...` heading style.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct DecisionsLog {
    path: PathBuf,
}

impl DecisionsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry: a heading plus optional bullet lines.
    pub fn record(
        &self,
        iteration: u32,
        title: &str,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut entry = format!(
            "\n## [Iteration {iteration}] {title}\n_{}_\n",
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );
        for line in lines {
            entry.push_str("- ");
            entry.push_str(line);
            entry.push('\n');
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(())
    }

    /// Last `max_lines` non-blank lines, or `None` if the log is empty or absent.
    pub fn recent(&self, max_lines: usize) -> Result<Option<String>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Ok(None);
        }
        let start = lines.len().saturating_sub(max_lines);
        Ok(Some(lines[start..].join("\n")))
    }
}
