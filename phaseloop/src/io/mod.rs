//! Side-effecting helpers: files, processes, git and the provider.

pub mod config;
pub mod decisions_log;
pub mod git;
pub mod heartbeat;
pub mod iteration_log;
pub mod plan_file;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod run_dir;
pub mod session_store;
