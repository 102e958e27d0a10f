//! Configuration stored under `.phaseloop/config.toml`.
//!
//! Precedence, lowest to highest: built-in defaults, the TOML file,
//! `PHASELOOP_*` environment variables, then CLI flags applied by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::circuit_breaker::BreakerConfig;
use crate::core::limits::Limits;
use crate::core::phase::{Mode, ModelTier};

/// Project-relative location of the config file.
pub const CONFIG_PATH: &str = ".phaseloop/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Ceiling on provider calls across all cycles.
    pub max_iterations: u32,
    /// Complete workflow passes per run.
    pub max_cycles: u32,
    /// Ceiling on cumulative provider cost in USD.
    pub cost_limit_usd: f64,
    pub mode: Mode,
    /// Name inside the status block markers (`---<NAME>_STATUS---`).
    pub status_marker: String,
    /// Run directories live here, relative to the project root.
    pub runs_dir: PathBuf,
    pub run_prefix: String,
    /// Idle time after which the heartbeat warns about a stall.
    pub stall_timeout_minutes: u64,
    pub heartbeat_interval_secs: u64,
    /// Write a checkpoint entry to the decision log every N iterations (0 disables).
    pub checkpoint_interval: u32,
    /// Byte budget for the rendered user prompt.
    pub prompt_budget_bytes: usize,
    pub provider: ProviderConfig,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider CLI executable.
    pub command: String,
    pub model: String,
    /// Model for plan-tier phases; falls back to `model`.
    pub plan_model: Option<String>,
    /// Model for review-tier phases; falls back to `model`.
    pub review_model: Option<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Feed the previous failure back into the prompt on retry.
    pub error_aware_retries: bool,
    pub max_error_context_chars: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: "sonnet".to_string(),
            plan_model: None,
            review_model: None,
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            max_retries: 3,
            retry_delay_secs: 5,
            error_aware_retries: true,
            max_error_context_chars: 2000,
        }
    }
}

impl ProviderConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        let specific = match tier {
            ModelTier::Plan => self.plan_model.as_deref(),
            ModelTier::Review => self.review_model.as_deref(),
            ModelTier::Default => None,
        };
        specific.unwrap_or(&self.model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_cycles: 10,
            cost_limit_usd: 10.0,
            mode: Mode::Standard,
            status_marker: "PHASELOOP".to_string(),
            runs_dir: PathBuf::from(".phaseloop/runs"),
            run_prefix: "phaseloop".to_string(),
            stall_timeout_minutes: 15,
            heartbeat_interval_secs: 60,
            checkpoint_interval: 10,
            prompt_budget_bytes: 60_000,
            provider: ProviderConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be > 0"));
        }
        if !(self.cost_limit_usd.is_finite() && self.cost_limit_usd > 0.0) {
            return Err(anyhow!("cost_limit_usd must be a positive number"));
        }
        if self.status_marker.trim().is_empty()
            || !self
                .status_marker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(anyhow!(
                "status_marker must be non-empty ASCII letters, digits or underscores"
            ));
        }
        if self.run_prefix.trim().is_empty() {
            return Err(anyhow!("run_prefix must be non-empty"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(anyhow!("heartbeat_interval_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.provider.command.trim().is_empty() {
            return Err(anyhow!("provider.command must be non-empty"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(anyhow!("provider.model must be non-empty"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if self.breaker.threshold == 0 {
            return Err(anyhow!("breaker.threshold must be > 0"));
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_iterations: self.max_iterations,
            cost_limit_usd: self.cost_limit_usd,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_minutes * 60)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Apply `PHASELOOP_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(raw) = get("PHASELOOP_MAX_ITERATIONS") {
            self.max_iterations = parse_var("PHASELOOP_MAX_ITERATIONS", &raw)?;
        }
        if let Some(raw) = get("PHASELOOP_MAX_CYCLES") {
            self.max_cycles = parse_var("PHASELOOP_MAX_CYCLES", &raw)?;
        }
        if let Some(raw) = get("PHASELOOP_COST_LIMIT") {
            self.cost_limit_usd = parse_var("PHASELOOP_COST_LIMIT", &raw)?;
        }
        if let Some(raw) = get("PHASELOOP_MODE") {
            self.mode = Mode::parse(&raw).ok_or_else(|| {
                anyhow!("PHASELOOP_MODE must be `standard` or `comprehensive`, got `{raw}`")
            })?;
        }
        if let Some(raw) = get("PHASELOOP_MODEL") {
            self.provider.model = raw;
        }
        if let Some(raw) = get("PHASELOOP_PLAN_MODEL") {
            self.provider.plan_model = Some(raw);
        }
        if let Some(raw) = get("PHASELOOP_REVIEW_MODEL") {
            self.provider.review_model = Some(raw);
        }
        if let Some(raw) = get("PHASELOOP_PROVIDER_COMMAND") {
            self.provider.command = raw;
        }
        if let Some(raw) = get("PHASELOOP_RUNS_DIR") {
            self.runs_dir = PathBuf::from(raw);
        }
        if let Some(raw) = get("PHASELOOP_STALL_TIMEOUT_MINUTES") {
            self.stall_timeout_minutes = parse_var("PHASELOOP_STALL_TIMEOUT_MINUTES", &raw)?;
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid {name}=`{raw}`: {err}"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Load the project config, apply process environment overrides and validate.
pub fn load_project_config(root: &Path) -> Result<Config> {
    let mut cfg = load_config(&root.join(CONFIG_PATH))?;
    cfg.apply_env(|name| std::env::var(name).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_iterations = 7\nmode = \"comprehensive\"\n\n[provider]\nreview_model = \"opus\"\n\n[breaker]\nthreshold = 4\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.mode, Mode::Comprehensive);
        assert_eq!(cfg.provider.model_for(ModelTier::Review), "opus");
        assert_eq!(cfg.provider.model_for(ModelTier::Plan), "sonnet");
        assert_eq!(cfg.breaker.threshold, 4);
        assert_eq!(cfg.breaker.max_phase_iterations, 10);
        assert_eq!(cfg.cost_limit_usd, 10.0);
        assert_eq!(cfg.max_cycles, 10);
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PHASELOOP_MAX_ITERATIONS", "12"),
            ("PHASELOOP_COST_LIMIT", "2.5"),
            ("PHASELOOP_MODE", "COMPREHENSIVE"),
            ("PHASELOOP_PLAN_MODEL", "opus"),
            ("PHASELOOP_RUNS_DIR", "custom/runs"),
            ("PHASELOOP_MODEL", "  "),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .expect("apply env");

        assert_eq!(cfg.max_iterations, 12);
        assert_eq!(cfg.cost_limit_usd, 2.5);
        assert_eq!(cfg.mode, Mode::Comprehensive);
        assert_eq!(cfg.provider.model_for(ModelTier::Plan), "opus");
        assert_eq!(cfg.provider.model, "sonnet");
        assert_eq!(cfg.runs_dir, PathBuf::from("custom/runs"));
    }

    #[test]
    fn unparseable_env_value_names_the_variable() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env(|name| (name == "PHASELOOP_MAX_CYCLES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PHASELOOP_MAX_CYCLES"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases: Vec<(Config, &str)> = vec![
            (
                Config {
                    max_iterations: 0,
                    ..Config::default()
                },
                "max_iterations",
            ),
            (
                Config {
                    cost_limit_usd: 0.0,
                    ..Config::default()
                },
                "cost_limit_usd",
            ),
            (
                Config {
                    status_marker: "MY-MARK".to_string(),
                    ..Config::default()
                },
                "status_marker",
            ),
            (
                Config {
                    provider: ProviderConfig {
                        command: " ".to_string(),
                        ..ProviderConfig::default()
                    },
                    ..Config::default()
                },
                "provider.command",
            ),
        ];
        for (cfg, needle) in cases {
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains(needle), "{err}");
        }
    }
}
