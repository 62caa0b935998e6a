use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicywatchError {
    #[error("Config error: {0}")]
    Config(String),

    /// Misconfiguration that can never succeed on retry, e.g. an admission
    /// cost larger than the budget capacity.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("No schema registered for {module} version {version}")]
    UnregisteredSchema { module: String, version: String },

    #[error("Schema {module} version {version} is already registered and immutable")]
    SchemaRedefinition { module: String, version: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// How a single activity dispatch went wrong. The variant decides the retry
/// policy: transient classes retry with backoff and count toward the breaker,
/// validation fails the item but keeps the raw payload, fatal surfaces
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityFailure {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited by remote, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Activity timed out")]
    Timeout,

    #[error("Output failed validation: {0}")]
    Validation(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl ActivityFailure {
    /// Transient classes are worth another attempt; they also feed the
    /// breaker's failure counter.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActivityFailure::Transient(_)
                | ActivityFailure::RateLimited { .. }
                | ActivityFailure::Timeout
        )
    }
}
