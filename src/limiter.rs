//! Shared-resource admission control.
//!
//! Many fanned-out tasks contend for one external quota (the scrape target,
//! the LLM endpoint), so admission is a single serialized decision against a
//! persisted [`BudgetState`] — the sliding two-window estimate: requests in
//! the previous window count weighted by how much of it still overlaps the
//! trailing 60s, plus everything admitted in the current window. Denials
//! carry a wait hint; callers defer and retry rather than drop the request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ResourceBudget;
use crate::error::PolicywatchError;
use crate::store::FileStore;

/// Persisted admission counters for one resource key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub used_previous: u32,
    pub used_current: u32,
    pub last_admit: DateTime<Utc>,
}

impl BudgetState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self { used_previous: 0, used_current: 0, last_admit: now }
    }
}

/// Outcome of one admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Deferred { wait_hint: Duration },
}

pub struct RateLimiter {
    store: Arc<FileStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    pub fn admit(
        &self,
        resource: &str,
        cost: u32,
        budget: &ResourceBudget,
    ) -> Result<Admission, PolicywatchError> {
        self.admit_at(resource, cost, budget, Utc::now())
    }

    /// Admission with an explicit clock, the decision the scheduler calls.
    /// A cost that can never fit the capacity is a configuration error, not
    /// a retryable denial.
    pub fn admit_at(
        &self,
        resource: &str,
        cost: u32,
        budget: &ResourceBudget,
        now: DateTime<Utc>,
    ) -> Result<Admission, PolicywatchError> {
        if cost > budget.capacity {
            return Err(PolicywatchError::FatalConfig(format!(
                "admission cost {cost} exceeds capacity {} for resource {resource}",
                budget.capacity
            )));
        }

        let window_secs = budget.window_secs as i64;
        let capacity = budget.capacity;
        let key = format!("budgets/{resource}");

        let admission = self.store.update(&key, || BudgetState::fresh(now), |state| {
            let current_window = now.timestamp().div_euclid(window_secs);
            let last_window = state.last_admit.timestamp().div_euclid(window_secs);

            if last_window == current_window {
                // Same window, counters stand.
            } else if last_window == current_window - 1 {
                state.used_previous = state.used_current;
                state.used_current = 0;
            } else {
                // A full window elapsed since the last admit.
                state.used_previous = 0;
                state.used_current = 0;
            }

            let overlap = now.timestamp().rem_euclid(window_secs);
            let overlap_weight = (window_secs - overlap) as f64 / window_secs as f64;
            let used_total = state.used_previous as f64 * overlap_weight + state.used_current as f64;

            if used_total + cost as f64 <= capacity as f64 {
                state.used_current += cost;
                state.last_admit = now;
                Admission::Granted
            } else {
                // Budget frees up at the next window boundary at the latest.
                let wait = (window_secs - overlap).max(1) as u64;
                Admission::Deferred { wait_hint: Duration::from_secs(wait) }
            }
        })?;

        debug!(resource, cost, granted = matches!(admission, Admission::Granted), "admission decision");
        Ok(admission)
    }

    pub fn status(&self, resource: &str) -> Result<Option<BudgetState>, PolicywatchError> {
        self.store.read(&format!("budgets/{resource}"))
    }
}
