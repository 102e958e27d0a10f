//! Read-only git queries used to describe progress in the loop context.
//!
//! The loop never mutates the repository itself; commits are made by the
//! provider during the COMMIT phase. Callers treat any failure here as
//! "git unavailable".

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument};

/// Progress summary relative to the run's starting commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GitProgress {
    pub commits_since_start: u32,
    pub has_uncommitted_changes: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Number of commits reachable from HEAD but not from `start`.
    pub fn commits_since(&self, start: &str) -> Result<u32> {
        let range = format!("{start}..HEAD");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// True if the worktree has staged, unstaged or untracked changes.
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain"])?;
        Ok(out.lines().any(|line| !line.trim().is_empty()))
    }

    /// Best-effort progress summary; `None` when git cannot answer.
    #[instrument(skip_all)]
    pub fn progress(&self, starting_commit: Option<&str>) -> Option<GitProgress> {
        let start = starting_commit?;
        let queried = self.commits_since(start).and_then(|commits| {
            Ok(GitProgress {
                commits_since_start: commits,
                has_uncommitted_changes: self.has_uncommitted_changes()?,
            })
        });
        match queried {
            Ok(progress) => Some(progress),
            Err(err) => {
                debug!(err = %err, "git progress unavailable");
                None
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(["-c", "user.name=phaseloop", "-c", "user.email=phaseloop@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("spawn git")
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn reports_commits_and_dirty_worktree() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        git(root, &["init", "-q"]);
        fs::write(root.join("a.txt"), "a").expect("write a");
        git(root, &["add", "-A"]);
        git(root, &["commit", "-q", "-m", "first"]);

        let repo = Git::new(root);
        let start = repo.head_sha().expect("head sha");
        assert_eq!(start.len(), 40);
        assert_eq!(repo.commits_since(&start).expect("count"), 0);
        assert!(!repo.has_uncommitted_changes().expect("status"));

        fs::write(root.join("b.txt"), "b").expect("write b");
        assert!(repo.has_uncommitted_changes().expect("status"));
        git(root, &["add", "-A"]);
        git(root, &["commit", "-q", "-m", "second"]);

        assert_eq!(
            repo.progress(Some(&start)),
            Some(GitProgress {
                commits_since_start: 1,
                has_uncommitted_changes: false,
            })
        );
    }

    #[test]
    fn progress_is_none_outside_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = Git::new(temp.path());

        assert_eq!(repo.progress(Some("deadbeef")), None);
        assert_eq!(repo.progress(None), None);
    }
}
