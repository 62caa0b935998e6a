//! Configuration loaded from `policywatch.toml`.
//!
//! [`PolicywatchConfig`] holds every tunable: per-resource admission budgets,
//! per-workflow retry policy, breaker thresholds and endpoints. Values absent
//! from the file use sensible defaults. The `POLICYWATCH_API_KEY` environment
//! variable takes precedence over the file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::error::PolicywatchError;

/// Admission budget for one shared external resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceBudget {
    /// Admissible cost per window.
    pub capacity: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Retry and throttle policy for one workflow type.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// Maximum dispatch attempts before the item is marked Failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential retry backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long to wait when the rate limiter defers admission.
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    /// How many deferred admissions to tolerate before giving the slot back.
    #[serde(default = "default_max_defers")]
    pub max_defers: u32,
    /// Per-activity timeout; a timeout counts as a failure.
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,
    /// Admission cost of one dispatch against the stage resource.
    #[serde(default = "default_cost")]
    pub cost: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            throttle_delay_ms: default_throttle_delay_ms(),
            max_defers: default_max_defers(),
            activity_timeout_ms: default_activity_timeout_ms(),
            cost: default_cost(),
        }
    }
}

impl WorkflowConfig {
    /// Delay for a given retry attempt using exponential backoff.
    /// delay = retry_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.retry_delay_ms * 2u64.pow(attempt.saturating_sub(1).min(16))
    }
}

/// Circuit breaker tuning, shared by all workflow types.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Failures while Closed before the breaker opens.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Initial Open cooldown in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Ceiling for the doubling cooldown.
    #[serde(default = "default_cooldown_cap_ms")]
    pub cooldown_cap_ms: u64,
    /// Probe dispatches admitted while HalfOpen.
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    /// Failures older than this stop counting toward the threshold.
    #[serde(default = "default_failure_decay_ms")]
    pub failure_decay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_cap_ms: default_cooldown_cap_ms(),
            probe_count: default_probe_count(),
            failure_decay_ms: default_failure_decay_ms(),
        }
    }
}

/// External collaborator endpoints, one per shared resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    #[serde(default = "default_scrape_url")]
    pub scrape_url: String,
    #[serde(default = "default_llm_url")]
    pub llm_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            scrape_url: default_scrape_url(),
            llm_url: default_llm_url(),
        }
    }
}

/// Top-level configuration loaded from `policywatch.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicywatchConfig {
    /// Root directory for durable state and artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// API key sent to the LLM endpoint.
    #[serde(default)]
    pub api_key: String,

    /// Grace period before a Running item may be force-cancelled.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default)]
    pub endpoints: Endpoints,

    #[serde(default = "default_resources")]
    pub resources: HashMap<String, ResourceBudget>,

    #[serde(default = "default_workflows")]
    pub workflows: HashMap<String, WorkflowConfig>,

    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    60_000
}

fn default_throttle_delay_ms() -> u64 {
    20_000
}

fn default_max_defers() -> u32 {
    30
}

fn default_activity_timeout_ms() -> u64 {
    120_000
}

fn default_cost() -> u32 {
    1
}

fn default_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    5 * 60_000
}

fn default_cooldown_cap_ms() -> u64 {
    60 * 60_000
}

fn default_probe_count() -> u32 {
    2
}

fn default_failure_decay_ms() -> u64 {
    10 * 60_000
}

fn default_scrape_url() -> String {
    "https://web.archive.org/web".to_string()
}

fn default_llm_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_cancel_grace_ms() -> u64 {
    10 * 60_000
}

// The scrape target tolerates far less traffic than the LLM quota; local
// transforms get a budget wide enough to never throttle in practice.
fn default_resources() -> HashMap<String, ResourceBudget> {
    HashMap::from([
        ("scrape-api".to_string(), ResourceBudget { capacity: 10, window_secs: 60 }),
        ("llm".to_string(), ResourceBudget { capacity: 50, window_secs: 60 }),
        ("local".to_string(), ResourceBudget { capacity: 1000, window_secs: 60 }),
    ])
}

fn default_workflows() -> HashMap<String, WorkflowConfig> {
    let fast = WorkflowConfig { retry_delay_ms: 10_000, activity_timeout_ms: 30_000, ..Default::default() };
    HashMap::from([
        ("scraper".to_string(), WorkflowConfig { retry_delay_ms: 120_000, ..Default::default() }),
        ("parser".to_string(), fast.clone()),
        ("differ".to_string(), fast),
        ("summarizer".to_string(), WorkflowConfig::default()),
        ("judge".to_string(), WorkflowConfig { retry_delay_ms: 180_000, ..Default::default() }),
    ])
}

impl Default for PolicywatchConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_key: String::new(),
            cancel_grace_ms: default_cancel_grace_ms(),
            endpoints: Endpoints::default(),
            resources: default_resources(),
            workflows: default_workflows(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl PolicywatchConfig {
    /// Load configuration from `policywatch.toml` in the current directory.
    /// Falls back to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("policywatch.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<PolicywatchConfig>(&contents)?
        } else {
            Self::default()
        };

        // Environment variable takes precedence over the config file.
        if let Ok(key) = std::env::var("POLICYWATCH_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    pub fn workflow(&self, workflow: &str) -> Result<&WorkflowConfig, PolicywatchError> {
        self.workflows
            .get(workflow)
            .ok_or_else(|| PolicywatchError::Config(format!("no workflow config for {workflow}")))
    }

    pub fn budget(&self, resource: &str) -> Result<&ResourceBudget, PolicywatchError> {
        self.resources
            .get(resource)
            .ok_or_else(|| PolicywatchError::Config(format!("no budget for resource {resource}")))
    }
}
