//! Test-only fixtures: plans, status blocks, a scripted provider and a
//! capturing reporter.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tempfile::TempDir;

use crate::core::status_block::{
    BlockedDetails, ExecutionStatus, StatusBlock, StatusCodec, TestsStatus, WorkType,
};
use crate::error::ProviderError;
use crate::interrupt::InterruptFlag;
use crate::io::config::Config;
use crate::io::provider::{Provider, ProviderRequest, ProviderResponse, ResponseMetadata};
use crate::io::run_dir::RunDir;
use crate::report::{Level, Reporter};

/// Temporary project root with a config tuned for fast tests: no retry delay,
/// a heartbeat that never fires and a single cycle per run.
pub struct TestProject {
    dir: TempDir,
    pub config: Config,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.provider.retry_delay_secs = 0;
        config.heartbeat_interval_secs = 3600;
        config.max_cycles = 1;
        Ok(Self { dir, config })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Scripted provider bound to this project's runs directory.
    pub fn provider(&self) -> ScriptedProvider {
        ScriptedProvider::for_config(self.path(), &self.config)
    }

    /// Newest run directory, if any run was created.
    pub fn latest_run(&self) -> Result<Option<RunDir>> {
        RunDir::find_last(&self.path().join(&self.config.runs_dir), &self.config.run_prefix)
    }
}

/// A plan with every standard phase section.
///
/// PLAN is done, IMPLEMENT has one task done and two open, REVIEW, TEST and
/// FINAL-REVIEW have one open task each, and COMMIT has no tasks.
pub fn sample_plan() -> String {
    "# Plan: add a --verbose flag\n\
     \n\
     ## Phase 1: PLAN\n\
     - [x] Read the CLI entry point\n\
     - [x] Write this plan\n\
     \n\
     ## Phase 2: IMPLEMENT\n\
     - [x] Add the flag to the argument parser\n\
     - [ ] Thread verbosity into the logger\n\
     - [ ] Document the flag in the README\n\
     \n\
     ## Phase 3: REVIEW\n\
     - [ ] Review the logger changes\n\
     \n\
     ## Phase 4: TEST\n\
     - [ ] Run the test suite\n\
     \n\
     ## Phase 5: FINAL-REVIEW\n\
     - [ ] Confirm every task above is checked\n\
     \n\
     ## Phase 6: COMMIT\n"
        .to_string()
}

/// `sample_plan` with every task checked.
pub fn finished_plan() -> String {
    sample_plan().replace("- [ ]", "- [x]")
}

/// Builder for [`StatusBlock`] with quiet defaults: in progress, no work done,
/// tests not run, implementation work, no exit signal.
#[derive(Debug, Clone)]
pub struct StatusBlockBuilder {
    block: StatusBlock,
}

impl Default for StatusBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBlockBuilder {
    pub fn new() -> Self {
        Self {
            block: StatusBlock {
                status: ExecutionStatus::InProgress,
                tasks_completed: 0,
                files_modified: 0,
                tests_status: TestsStatus::NotRun,
                work_type: WorkType::Implementation,
                exit_signal: false,
                recommendation: "Continue with the next task".to_string(),
                blocked: None,
            },
        }
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.block.status = status;
        self
    }

    pub fn exit_signal(mut self, exit_signal: bool) -> Self {
        self.block.exit_signal = exit_signal;
        self
    }

    pub fn files_modified(mut self, files: u32) -> Self {
        self.block.files_modified = files;
        self
    }

    pub fn tasks_completed(mut self, tasks: u32) -> Self {
        self.block.tasks_completed = tasks;
        self
    }

    pub fn tests_status(mut self, tests: TestsStatus) -> Self {
        self.block.tests_status = tests;
        self
    }

    pub fn work_type(mut self, work_type: WorkType) -> Self {
        self.block.work_type = work_type;
        self
    }

    pub fn recommendation(mut self, text: &str) -> Self {
        self.block.recommendation = text.to_string();
        self
    }

    /// Mark the turn `BLOCKED` with `reason`.
    pub fn blocked(mut self, reason: &str) -> Self {
        self.block.status = ExecutionStatus::Blocked;
        self.block.blocked = Some(BlockedDetails {
            reason: Some(reason.to_string()),
            resources: Vec::new(),
            resolution: None,
        });
        self
    }

    pub fn build(self) -> StatusBlock {
        self.block
    }
}

/// One scripted provider turn.
#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        content: String,
        cost: f64,
        /// Written to the newest run's `plan.md` before replying.
        plan: Option<String>,
    },
    Fail(ProviderError),
    /// Raise `flag` as if the operator pressed Ctrl-C mid-call, then fail.
    InterruptThenFail {
        flag: InterruptFlag,
        err: ProviderError,
    },
}

/// Provider that plays back queued [`Step`]s and records every request.
///
/// An exhausted script fails with a non-retryable error.
pub struct ScriptedProvider {
    runs_dir: PathBuf,
    run_prefix: String,
    codec: StatusCodec,
    available: bool,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    /// Provider for runs created under `root` with `config`.
    pub fn for_config(root: &Path, config: &Config) -> Self {
        Self {
            runs_dir: root.join(&config.runs_dir),
            run_prefix: config.run_prefix.clone(),
            codec: StatusCodec::new(&config.status_marker),
            available: true,
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Queue a reply carrying `status`.
    pub fn reply(self, status: StatusBlock, cost: f64) -> Self {
        let content = self.content_for(&status);
        self.step(Step::Reply {
            content,
            cost,
            plan: None,
        })
    }

    /// Queue a reply that also rewrites the run's plan.
    pub fn reply_with_plan(self, status: StatusBlock, cost: f64, plan: &str) -> Self {
        let content = self.content_for(&status);
        self.step(Step::Reply {
            content,
            cost,
            plan: Some(plan.to_string()),
        })
    }

    /// Queue a reply with arbitrary text, status block or not.
    pub fn reply_raw(self, content: &str, cost: f64) -> Self {
        self.step(Step::Reply {
            content: content.to_string(),
            cost,
            plan: None,
        })
    }

    pub fn fail(self, err: ProviderError) -> Self {
        self.step(Step::Fail(err))
    }

    pub fn interrupt_then_fail(self, flag: &InterruptFlag, err: ProviderError) -> Self {
        self.step(Step::InterruptThenFail {
            flag: flag.clone(),
            err,
        })
    }

    pub fn step(self, step: Step) -> Self {
        lock(&self.steps).push_back(step);
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.steps).len()
    }

    fn content_for(&self, status: &StatusBlock) -> String {
        format!("Worked on the task.\n\n{}", self.codec.render(status))
    }

    fn write_plan(&self, plan: &str) -> Result<(), ProviderError> {
        let run = RunDir::find_last(&self.runs_dir, &self.run_prefix)
            .map_err(|err| ProviderError::fatal(format!("{err:#}")))?
            .ok_or_else(|| ProviderError::fatal("no run directory to write the plan into"))?;
        fs::write(&run.plan_path, plan).map_err(|err| ProviderError::fatal(err.to_string()))
    }
}

impl Provider for ScriptedProvider {
    fn execute_once(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        lock(&self.requests).push(request.clone());
        let step = lock(&self.steps).pop_front();
        match step {
            Some(Step::Reply {
                content,
                cost,
                plan,
            }) => {
                if let Some(plan) = plan {
                    self.write_plan(&plan)?;
                }
                Ok(ProviderResponse {
                    raw_output: format!("{{\"result\":{content:?}}}"),
                    content,
                    metadata: ResponseMetadata {
                        model: request.model.clone(),
                        cost_usd: Some(cost),
                        ..ResponseMetadata::default()
                    },
                    is_error: false,
                    error_message: None,
                })
            }
            Some(Step::Fail(err)) => Err(err),
            Some(Step::InterruptThenFail { flag, err }) => {
                flag.trigger();
                Err(err)
            }
            None => Err(ProviderError::fatal("scripted provider has no more steps")),
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Reporter that keeps every line as `<level>: <message>`.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    lines: Mutex<Vec<String>>,
}

impl MemoryReporter {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.lines).iter().any(|line| line.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, level: Level, message: &str) {
        lock(&self.lines).push(format!("{}: {message}", level.label()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
