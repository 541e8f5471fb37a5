use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Jitter strategy ───────────────────────────────────────────

/// How evaluation phases are spread across the base tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JitterStrategy {
    /// No offset: every group with the same interval ticks together.
    #[default]
    Never,
    /// One offset per rule group.
    ByGroup,
    /// One offset per rule.
    ByRule,
}

impl FromStr for JitterStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "never" | "none" => Ok(JitterStrategy::Never),
            "by-group" | "bygroup" | "group" => Ok(JitterStrategy::ByGroup),
            "by-rule" | "byrule" | "rule" => Ok(JitterStrategy::ByRule),
            other => Err(CoreError::Config(format!("unknown jitter strategy '{other}'"))),
        }
    }
}

impl fmt::Display for JitterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitterStrategy::Never => write!(f, "never"),
            JitterStrategy::ByGroup => write!(f, "by-group"),
            JitterStrategy::ByRule => write!(f, "by-rule"),
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per evaluation, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Delays are drawn from `[d - f*d, d + f*d]`.
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            randomization_factor: 0.0,
        }
    }
}

// ── Scheduler config ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Tick granularity. Every rule interval must be a multiple of it.
    pub base_interval: Duration,
    /// Skip propagating the folder title into alert labels.
    pub disable_folder_label: bool,
    pub retry: RetryConfig,
    pub jitter: JitterStrategy,
    /// Evaluate the rules of a group one after another, in group order.
    pub sequential_evaluation: bool,
    /// Orgs whose rules are never scheduled.
    pub disabled_orgs: Vec<i64>,
    /// Refresh period of the background rule fetcher.
    pub fetch_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            base_interval: Duration::from_secs(10),
            disable_folder_label: false,
            retry: RetryConfig::default(),
            jitter: JitterStrategy::Never,
            sequential_evaluation: false,
            disabled_orgs: Vec::new(),
            fetch_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CADENCE_PROFILE`.
    pub fn from_env() -> Result<Self, CoreError> {
        let profile = env_or("CADENCE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    pub fn for_profile(profile: &str) -> Result<Self, CoreError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let defaults = Self::default();

        let jitter = match profiled_env_opt(p, "SCHEDULER_JITTER") {
            Some(v) => v.parse()?,
            None => defaults.jitter,
        };

        let disabled_orgs = match profiled_env_opt(p, "SCHEDULER_DISABLED_ORGS") {
            Some(v) => parse_org_list(&v)?,
            None => Vec::new(),
        };

        let config = Self {
            profile: p.to_string(),
            base_interval: Duration::from_secs(profiled_env_parse(
                p,
                "SCHEDULER_BASE_INTERVAL_SECONDS",
                defaults.base_interval.as_secs(),
            )),
            disable_folder_label: profiled_env_bool(p, "SCHEDULER_DISABLE_FOLDER_LABEL", false),
            retry: RetryConfig {
                max_attempts: profiled_env_parse(p, "SCHEDULER_MAX_ATTEMPTS", defaults.retry.max_attempts),
                initial_delay: Duration::from_millis(profiled_env_parse(
                    p,
                    "SCHEDULER_INITIAL_RETRY_DELAY_MS",
                    defaults.retry.initial_delay.as_millis() as u64,
                )),
                max_delay: Duration::from_millis(profiled_env_parse(
                    p,
                    "SCHEDULER_MAX_RETRY_DELAY_MS",
                    defaults.retry.max_delay.as_millis() as u64,
                )),
                randomization_factor: profiled_env_parse(
                    p,
                    "SCHEDULER_RETRY_RANDOMIZATION",
                    defaults.retry.randomization_factor,
                ),
            },
            jitter,
            sequential_evaluation: profiled_env_bool(p, "SCHEDULER_SEQUENTIAL", false),
            disabled_orgs,
            fetch_interval: Duration::from_secs(profiled_env_parse(
                p,
                "SCHEDULER_FETCH_INTERVAL_SECONDS",
                defaults.fetch_interval.as_secs(),
            )),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_interval.as_secs() == 0 {
            return Err(CoreError::Config(
                "base interval must be at least one second".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config("max attempts must be at least 1".to_string()));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(CoreError::Config(format!(
                "initial retry delay {:?} exceeds max retry delay {:?}",
                self.retry.initial_delay, self.retry.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.randomization_factor) {
            return Err(CoreError::Config(format!(
                "retry randomization factor {} is outside [0, 1]",
                self.retry.randomization_factor
            )));
        }
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded (profile: {}):", self.profile_label());
        tracing::info!("  base_interval:  {:?}", self.base_interval);
        tracing::info!("  jitter:         {}", self.jitter);
        tracing::info!("  sequential:     {}", self.sequential_evaluation);
        tracing::info!(
            "  retry:          attempts={}, initial={:?}, max={:?}, randomization={}",
            self.retry.max_attempts,
            self.retry.initial_delay,
            self.retry.max_delay,
            self.retry.randomization_factor
        );
        tracing::info!("  folder_label:   {}", !self.disable_folder_label);
        tracing::info!("  disabled_orgs:  {:?}", self.disabled_orgs);
    }
}

fn parse_org_list(raw: &str) -> Result<Vec<i64>, CoreError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| CoreError::Config(format!("invalid org id '{s}' in disabled orgs")))
        })
        .collect()
}
