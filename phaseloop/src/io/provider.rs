//! Provider abstraction for the AI backend.
//!
//! The [`Provider`] trait decouples the workflow from the process that does
//! the work (currently the `claude` CLI). Tests use scripted providers that
//! return queued responses without spawning anything.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::status_block::{StatusBlock, StatusCodec};
use crate::error::{ProtocolError, ProviderError};
use crate::interrupt::InterruptFlag;
use crate::io::config::ProviderConfig;
use crate::io::process::{is_spawn_not_found, run_command_with_timeout};

/// Messages that mean retrying cannot help.
const NON_RETRYABLE_PATTERNS: [&str; 5] = [
    "authentication",
    "unauthorized",
    "invalid api key",
    "permission denied",
    "forbidden",
];

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi regex"));

/// One provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Working directory for the provider process (the project root).
    pub workdir: PathBuf,
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMetadata {
    pub model: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub num_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Assistant text, where the status block is expected.
    pub content: String,
    /// Unparsed process output, kept for `last_output.txt`.
    pub raw_output: String,
    pub metadata: ResponseMetadata,
    pub is_error: bool,
    pub error_message: Option<String>,
}

/// Retry behavior for [`Provider::execute`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub delay: Duration,
    /// Append the previous failure to the user prompt on retry.
    pub error_aware: bool,
    pub max_error_context_chars: usize,
    pub sleep: fn(Duration),
    /// Once set, no further attempt is started.
    pub interrupt: InterruptFlag,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_secs),
            error_aware: config.error_aware_retries,
            max_error_context_chars: config.max_error_context_chars,
            sleep: thread::sleep,
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Abstraction over AI backends.
pub trait Provider: Send + Sync {
    /// Run a single call with no retries.
    fn execute_once(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// True when the backend can be invoked at all.
    fn is_available(&self) -> bool;

    /// Run a call, retrying retryable failures according to `policy`.
    ///
    /// Cost reported by failed attempts is folded into the returned response
    /// or error. An interrupt stops the loop before the next attempt.
    #[instrument(skip_all, fields(model = %request.model, max_retries = policy.max_retries))]
    fn execute(
        &self,
        request: &ProviderRequest,
        policy: &RetryPolicy,
    ) -> Result<ProviderResponse, ProviderError> {
        let attempts = policy.max_retries.max(1);
        let mut last_error: Option<ProviderError> = None;
        let mut spent: Option<f64> = None;

        for attempt in 1..=attempts {
            if policy.interrupt.is_set() {
                info!(attempt, "interrupt set, not starting another provider call");
                return Err(ProviderError::interrupted().with_cost(spent));
            }
            let mut attempt_request = request.clone();
            if policy.error_aware
                && let Some(err) = &last_error
            {
                info!(attempt, "including previous error in retry prompt");
                attempt_request.user_prompt = with_error_context(
                    &request.user_prompt,
                    attempt - 1,
                    &err.message,
                    policy.max_error_context_chars,
                );
            }

            match self.execute_once(&attempt_request) {
                Ok(mut response) => {
                    if spent.is_some() {
                        response.metadata.cost_usd = add_cost(spent, response.metadata.cost_usd);
                    }
                    return Ok(response);
                }
                Err(err) if !err.retryable => {
                    warn!(attempt, err = %err, "non-retryable provider error");
                    let cost = add_cost(spent, err.cost_usd);
                    return Err(err.with_cost(cost));
                }
                Err(err) => {
                    warn!(attempt, attempts, err = %err, "retryable provider error");
                    spent = add_cost(spent, err.cost_usd);
                    if policy.interrupt.is_set() {
                        info!(attempt, "interrupt set, abandoning retries");
                        return Err(ProviderError::interrupted().with_cost(spent));
                    }
                    if attempt < attempts {
                        (policy.sleep)(policy.delay);
                    }
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.map_or_else(|| "no attempt made".to_string(), |err| err.message);
        Err(ProviderError::fatal(format!(
            "provider retries exhausted after {attempts} attempts; last error: {last}"
        ))
        .with_cost(spent))
    }

    /// Cost of one response in USD; zero when the backend did not report it.
    fn get_cost(&self, response: &ProviderResponse) -> f64 {
        response.metadata.cost_usd.unwrap_or(0.0)
    }

    fn extract_status_block(
        &self,
        response: &ProviderResponse,
        codec: &StatusCodec,
    ) -> Result<StatusBlock, ProtocolError> {
        codec.parse(&response.content)
    }

    fn validate_response(&self, response: &ProviderResponse, codec: &StatusCodec) -> bool {
        !response.is_error && self.extract_status_block(response, codec).is_ok()
    }
}

fn add_cost(total: Option<f64>, more: Option<f64>) -> Option<f64> {
    match (total, more) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn with_error_context(prompt: &str, attempt: u32, error: &str, max_chars: usize) -> String {
    let mut error_text: String = error.chars().take(max_chars).collect();
    if error.chars().count() > max_chars {
        error_text.push_str("\n... (truncated)");
    }
    format!(
        "{prompt}\n\n<previous_attempt_error>\n\
         The previous attempt (#{attempt}) failed with:\n{error_text}\n\n\
         Diagnose the root cause (missing commands, wrong paths, processes waiting on \
         resources that do not exist, missing dependencies) and fix it before retrying the task.\n\
         </previous_attempt_error>"
    )
}

/// Provider that spawns the `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeCliProvider {
    command: String,
    output_limit_bytes: usize,
}

/// JSON envelope printed by `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    total_cost_usd: Option<f64>,
    session_id: Option<String>,
    num_turns: Option<u32>,
}

impl ClaudeCliProvider {
    pub fn new(command: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            command: command.into(),
            output_limit_bytes,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.command.clone(), config.output_limit_bytes)
    }
}

impl Provider for ClaudeCliProvider {
    #[instrument(skip_all, fields(command = %self.command, model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn execute_once(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        info!(workdir = %request.workdir.display(), "starting provider call");
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--model")
            .arg(&request.model)
            .arg("--output-format")
            .arg("json")
            .arg("--system-prompt")
            .arg(&request.system_prompt)
            .arg("--permission-mode")
            .arg("bypassPermissions")
            .current_dir(&request.workdir);

        let started = Instant::now();
        let output = run_command_with_timeout(
            cmd,
            Some(request.user_prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| {
            if is_spawn_not_found(&err) {
                ProviderError::fatal(format!("provider command not found: {}", self.command))
            } else {
                ProviderError::retryable(format!("failed to run provider command: {err:#}"))
            }
        })?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if output.timed_out {
            return Err(ProviderError::retryable(format!(
                "provider timed out after {}s",
                request.timeout.as_secs()
            )));
        }
        let raw_output = output.stdout_text();
        if !output.status.success() {
            let stderr = output.stderr_text();
            let message = format!(
                "provider exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
            // A killed or failing CLI may still have printed its envelope.
            let cost = serde_json::from_str::<Envelope>(raw_output.trim())
                .ok()
                .and_then(|envelope| envelope.total_cost_usd);
            return Err(classify(message).with_cost(cost));
        }

        let envelope: Envelope = serde_json::from_str(raw_output.trim()).map_err(|err| {
            ProviderError::retryable(format!("failed to parse provider JSON output: {err}"))
        })?;
        debug!(
            is_error = envelope.is_error,
            cost_usd = ?envelope.total_cost_usd,
            num_turns = ?envelope.num_turns,
            "parsed provider envelope"
        );

        if envelope.is_error {
            let detail = if envelope.errors.is_empty() {
                envelope.result.clone()
            } else {
                envelope
                    .errors
                    .iter()
                    .map(|e| e.as_str().map_or_else(|| e.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            let detail = if detail.trim().is_empty() {
                "unknown error".to_string()
            } else {
                detail
            };
            return Err(
                classify(format!("provider returned error: {detail}"))
                    .with_cost(envelope.total_cost_usd),
            );
        }

        let content = ANSI_RE.replace_all(&envelope.result, "").into_owned();
        if content.trim().is_empty() {
            return Err(ProviderError::retryable("provider returned empty result")
                .with_cost(envelope.total_cost_usd));
        }

        Ok(ProviderResponse {
            content,
            raw_output,
            metadata: ResponseMetadata {
                model: request.model.clone(),
                cost_usd: envelope.total_cost_usd,
                duration_ms,
                session_id: envelope.session_id,
                num_turns: envelope.num_turns,
            },
            is_error: false,
            error_message: None,
        })
    }

    fn is_available(&self) -> bool {
        let available = Command::new(&self.command)
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success());
        debug!(command = %self.command, available, "checked provider availability");
        available
    }
}

/// Non-retryable when the message names an authorization failure.
fn classify(message: String) -> ProviderError {
    let lower = message.to_lowercase();
    if NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        ProviderError::fatal(message)
    } else {
        ProviderError::retryable(message)
    }
}
