//! `phaseloop`: drive an AI coding agent through plan, implement, review, test
//! and commit phases until the work is done or a stop condition fires.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use phaseloop::core::phase::Mode;
use phaseloop::exit_codes;
use phaseloop::interrupt::{InterruptFlag, install_ctrl_c_handler};
use phaseloop::io::config::{Config, load_project_config};
use phaseloop::io::provider::ClaudeCliProvider;
use phaseloop::logging;
use phaseloop::orchestrator::LoopOutcome;
use phaseloop::report::{ConsoleReporter, Reporter};
use phaseloop::start::{RunContext, resume_run, start_run};
use phaseloop::status::run_status;

#[derive(Parser)]
#[command(
    name = "phaseloop",
    version,
    about = "Phase-driven autonomous coding agent loop"
)]
struct Cli {
    /// Project root the agent works in.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run for a task.
    Run {
        /// The task to work on.
        prompt: String,
        /// Add DISCOVER and ROADMAP phases.
        #[arg(long)]
        comprehensive: bool,
        /// Ceiling on provider calls across all cycles.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Complete workflow passes per run.
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Ceiling on cumulative provider cost in USD.
        #[arg(long)]
        cost_limit: Option<f64>,
        /// Default model for every phase.
        #[arg(long)]
        model: Option<String>,
    },
    /// Continue an interrupted or halted run.
    Resume {
        /// Run directory (defaults to the latest run).
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
    /// Print the persisted state of a run.
    Status {
        /// Run directory (defaults to the latest run).
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = load_project_config(&cli.root)?;
    match cli.command {
        Command::Run {
            prompt,
            comprehensive,
            max_iterations,
            max_cycles,
            cost_limit,
            model,
        } => {
            apply_overrides(
                &mut config,
                Overrides {
                    comprehensive,
                    max_iterations,
                    max_cycles,
                    cost_limit,
                    model,
                },
            )?;
            let outcome = with_context(&cli.root, &config, |ctx| {
                Ok(start_run(ctx, &prompt)?)
            })?;
            Ok(finish(outcome))
        }
        Command::Resume { run_dir } => {
            let outcome = with_context(&cli.root, &config, |ctx| {
                Ok(resume_run(ctx, run_dir.as_deref())?)
            })?;
            Ok(finish(outcome))
        }
        Command::Status { run_dir } => {
            let status = run_status(&cli.root, &config, run_dir.as_deref())?;
            println!("{status}");
            Ok(exit_codes::OK)
        }
    }
}

struct Overrides {
    comprehensive: bool,
    max_iterations: Option<u32>,
    max_cycles: Option<u32>,
    cost_limit: Option<f64>,
    model: Option<String>,
}

/// CLI flags win over the config file and the environment.
fn apply_overrides(config: &mut Config, overrides: Overrides) -> Result<()> {
    if overrides.comprehensive {
        config.mode = Mode::Comprehensive;
    }
    if let Some(max) = overrides.max_iterations {
        config.max_iterations = max;
    }
    if let Some(max) = overrides.max_cycles {
        config.max_cycles = max;
    }
    if let Some(limit) = overrides.cost_limit {
        config.cost_limit_usd = limit;
    }
    if let Some(model) = overrides.model {
        config.provider.model = model;
    }
    config.validate().context("invalid command line overrides")
}

fn with_context<F>(root: &std::path::Path, config: &Config, f: F) -> Result<LoopOutcome>
where
    F: FnOnce(&RunContext<'_>) -> Result<LoopOutcome>,
{
    let interrupt = InterruptFlag::new();
    install_ctrl_c_handler(interrupt.clone())?;
    let provider = ClaudeCliProvider::from_config(&config.provider);
    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);
    let ctx = RunContext {
        root,
        config,
        provider: &provider,
        reporter,
        interrupt,
    };
    f(&ctx)
}

fn finish(outcome: LoopOutcome) -> i32 {
    debug!(run_id = %outcome.run_id, stop = ?outcome.stop, "run finished");
    let code = outcome.stop.exit_code();
    let message = format!(
        "{} ({}, {} iteration(s) this session)",
        outcome.stop.describe(),
        outcome.run_id,
        outcome.iterations_executed
    );
    let reporter = ConsoleReporter;
    if code == exit_codes::OK {
        reporter.success(&message);
    } else {
        reporter.error(&message);
    }
    code
}
