//! Per-workflow-type circuit breakers.
//!
//! Failures within one workflow type are assumed to share a cause (resource
//! outage, schema drift), so the breaker is keyed by workflow type, not per
//! item. State machine: Closed → Open → HalfOpen → {Closed | Open}. While
//! Open every dispatch is denied without touching the external collaborator;
//! after the cooldown a fixed number of probes decide whether to close again.
//! A probe failure reopens with the cooldown doubled up to a cap.
//!
//! Records are created lazily on first use and persist across restarts via
//! the state store's atomic read-modify-write. A manual reset forces Closed
//! regardless of counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::PolicywatchError;
use crate::store::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Persisted breaker record for one workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
    pub probes_issued: u32,
    pub probe_successes: u32,
    pub half_opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BreakerRecord {
    fn fresh(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
            cooldown_ms: config.cooldown_ms,
            probes_issued: 0,
            probe_successes: 0,
            half_opened_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }
}

/// Whether a dispatch may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// HalfOpen probe: proceed, but the outcome decides the next transition.
    Probe,
    Deny { retry_after: Duration },
}

pub struct BreakerRegistry {
    store: Arc<FileStore>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(store: Arc<FileStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    fn key(workflow: &str) -> String {
        format!("breakers/{workflow}")
    }

    pub fn check(&self, workflow: &str) -> Result<BreakerDecision, PolicywatchError> {
        self.check_at(workflow, Utc::now())
    }

    /// Gate one dispatch. Open denies outright until the cooldown elapses,
    /// then the record moves to HalfOpen and hands out probe slots.
    pub fn check_at(&self, workflow: &str, now: DateTime<Utc>) -> Result<BreakerDecision, PolicywatchError> {
        let config = self.config.clone();
        self.store.update(&Self::key(workflow), || BreakerRecord::fresh(&config), |rec| {
            match rec.state {
                BreakerState::Closed => BreakerDecision::Allow,
                BreakerState::Open => {
                    let cooldown = chrono::Duration::milliseconds(rec.cooldown_ms as i64);
                    let elapsed = rec.opened_at.map(|t| now - t).unwrap_or(cooldown);
                    if elapsed >= cooldown {
                        rec.state = BreakerState::HalfOpen;
                        rec.probes_issued = 1;
                        rec.probe_successes = 0;
                        rec.half_opened_at = Some(now);
                        BreakerDecision::Probe
                    } else {
                        let remaining = (cooldown - elapsed).num_milliseconds().max(0) as u64;
                        BreakerDecision::Deny { retry_after: Duration::from_millis(remaining) }
                    }
                }
                BreakerState::HalfOpen => {
                    if rec.probes_issued < config.probe_count {
                        rec.probes_issued += 1;
                        BreakerDecision::Probe
                    } else {
                        let cooldown = chrono::Duration::milliseconds(rec.cooldown_ms as i64);
                        let elapsed = rec.half_opened_at.map(|t| now - t).unwrap_or(cooldown);
                        if elapsed >= cooldown {
                            // Outstanding probes never reported back (the
                            // prober died); hand the slots out again rather
                            // than denying until a manual reset.
                            rec.probes_issued = 1;
                            rec.probe_successes = 0;
                            rec.half_opened_at = Some(now);
                            BreakerDecision::Probe
                        } else {
                            // Probe slots taken; wait for their outcomes.
                            let remaining = (cooldown - elapsed).num_milliseconds().max(0) as u64;
                            BreakerDecision::Deny { retry_after: Duration::from_millis(remaining) }
                        }
                    }
                }
            }
        })
    }

    pub fn record_success(&self, workflow: &str) -> Result<(), PolicywatchError> {
        let config = self.config.clone();
        let closed = self.store.update(&Self::key(workflow), || BreakerRecord::fresh(&config), |rec| {
            match rec.state {
                // Consecutive-failure semantics: any success clears the count.
                BreakerState::Closed => {
                    rec.failures = 0;
                    false
                }
                BreakerState::HalfOpen => {
                    rec.probe_successes += 1;
                    if rec.probe_successes >= config.probe_count {
                        *rec = BreakerRecord::fresh(&config);
                        true
                    } else {
                        false
                    }
                }
                BreakerState::Open => false,
            }
        })?;
        if closed {
            info!(workflow, "circuit breaker closed after successful probes");
        }
        Ok(())
    }

    pub fn record_failure(&self, workflow: &str, reason: &str) -> Result<(), PolicywatchError> {
        self.record_failure_at(workflow, reason, Utc::now())
    }

    pub fn record_failure_at(
        &self,
        workflow: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PolicywatchError> {
        let config = self.config.clone();
        let opened = self.store.update(&Self::key(workflow), || BreakerRecord::fresh(&config), |rec| {
            match rec.state {
                BreakerState::Closed => {
                    // Stale failures stop counting toward the threshold.
                    let decay = chrono::Duration::milliseconds(config.failure_decay_ms as i64);
                    if rec.last_failure_at.is_some_and(|t| now - t > decay) {
                        rec.failures = 0;
                    }
                    rec.failures += 1;
                    rec.last_failure_at = Some(now);
                    rec.last_error = Some(reason.to_string());
                    if rec.failures >= config.threshold {
                        rec.state = BreakerState::Open;
                        rec.opened_at = Some(now);
                        true
                    } else {
                        false
                    }
                }
                BreakerState::HalfOpen => {
                    // Failed probe: reopen and back off on the breaker itself.
                    rec.state = BreakerState::Open;
                    rec.opened_at = Some(now);
                    rec.cooldown_ms = (rec.cooldown_ms * 2).min(config.cooldown_cap_ms);
                    rec.probes_issued = 0;
                    rec.probe_successes = 0;
                    rec.half_opened_at = None;
                    rec.last_failure_at = Some(now);
                    rec.last_error = Some(reason.to_string());
                    true
                }
                BreakerState::Open => {
                    rec.last_failure_at = Some(now);
                    rec.last_error = Some(reason.to_string());
                    false
                }
            }
        })?;
        if opened {
            warn!(workflow, reason, "circuit breaker opened");
        }
        Ok(())
    }

    /// Force Closed regardless of counters.
    pub fn reset(&self, workflow: &str) -> Result<(), PolicywatchError> {
        let config = self.config.clone();
        self.store.update(&Self::key(workflow), || BreakerRecord::fresh(&config), |rec| {
            *rec = BreakerRecord::fresh(&config);
        })?;
        info!(workflow, "circuit breaker reset");
        Ok(())
    }

    /// Stored record, `None` when no dispatch has touched this workflow yet.
    pub fn status(&self, workflow: &str) -> Result<Option<BreakerRecord>, PolicywatchError> {
        self.store.read(&Self::key(workflow))
    }

    /// Workflow types with a breaker record.
    pub fn known_workflows(&self) -> Result<Vec<String>, PolicywatchError> {
        Ok(self
            .store
            .list_keys("breakers")?
            .into_iter()
            .filter_map(|k| k.strip_prefix("breakers/").map(str::to_string))
            .collect())
    }
}
