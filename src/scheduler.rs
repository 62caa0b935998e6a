//! Durable fan-out pipeline scheduler.
//!
//! Drives work items through the pipeline stages, one driver future per item
//! per stage. Every dispatch is gated twice: the circuit breaker for the
//! stage's workflow type fails fast when the collaborator is down, and the
//! rate limiter defers until the stage's resource budget admits the request
//! (the limiter, not a worker pool, bounds effective parallelism). Item
//! status, attempt history and stage completions are checkpointed to the
//! state store before every suspension point, so a crash resumes exactly
//! where it left off: Succeeded stages never re-run and in-flight items are
//! retried, never lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::activity::{ActivityExecutor, ActivityOutput, ActivityRequest};
use crate::breaker::{BreakerDecision, BreakerRegistry};
use crate::config::{PolicywatchConfig, WorkflowConfig};
use crate::error::{ActivityFailure, PolicywatchError};
use crate::item::{AttemptRecord, ItemKey, ItemStatus, Stage, WorkItem};
use crate::limiter::{Admission, RateLimiter};
use crate::schema::{ChunkEnvelope, RunMetadata, SchemaRegistry};
use crate::store::{ArtifactStore, FileStore};

/// How one item's drive through a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DriveResult {
    Succeeded,
    Failed(String),
    /// Not dispatched this pass (breaker open or budget exhausted); the item
    /// stays eligible for a later pass.
    Deferred(String),
}

/// Per-stage outcome summary for one scheduler pass.
#[derive(Debug, Default, Clone)]
pub struct StageReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub deferred: Vec<(String, String)>,
}

impl StageReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
    }
}

/// Outcome of a cancel command.
#[derive(Debug, Default, Clone)]
pub struct CancelReport {
    pub cancelled: Vec<String>,
    /// Running items still inside the grace period; they finish or get
    /// cancelled on a later pass, never silently dropped.
    pub draining: Vec<String>,
}

/// Seed file shape: a list of document snapshots to enqueue.
#[derive(Debug, Deserialize)]
pub struct SeedFile {
    pub items: Vec<SeedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub company: String,
    pub policy: String,
    pub timestamp: String,
}

impl SeedEntry {
    /// Parse a `company/policy/timestamp` id as given on the command line.
    pub fn parse_id(id: &str) -> Result<Self, PolicywatchError> {
        let mut parts = id.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(company), Some(policy), Some(timestamp))
                if !company.is_empty() && !policy.is_empty() && !timestamp.is_empty() =>
            {
                Ok(Self {
                    company: company.to_string(),
                    policy: policy.to_string(),
                    timestamp: timestamp.to_string(),
                })
            }
            _ => Err(PolicywatchError::Config(format!(
                "invalid item id {id:?}, expected company/policy/timestamp"
            ))),
        }
    }
}

pub struct Scheduler<E> {
    store: Arc<FileStore>,
    artifacts: ArtifactStore,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    registry: SchemaRegistry,
    executor: E,
    config: PolicywatchConfig,
}

impl<E: ActivityExecutor> Scheduler<E> {
    pub fn new(
        config: PolicywatchConfig,
        store: Arc<FileStore>,
        artifacts: ArtifactStore,
        registry: SchemaRegistry,
        executor: E,
    ) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&store));
        let breakers = BreakerRegistry::new(Arc::clone(&store), config.breaker.clone());
        Self { store, artifacts, limiter, breakers, registry, executor, config }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn item_store_key(id: &str) -> String {
        format!("items/{id}")
    }

    fn put_item(&self, item: &WorkItem) -> Result<(), PolicywatchError> {
        self.store.put(&Self::item_store_key(&item.id()), item)
    }

    pub fn get_item(&self, id: &str) -> Result<WorkItem, PolicywatchError> {
        self.store
            .read(&Self::item_store_key(id))?
            .ok_or_else(|| PolicywatchError::ItemNotFound(id.to_string()))
    }

    pub fn load_items(&self) -> Result<Vec<WorkItem>, PolicywatchError> {
        let mut items = Vec::new();
        for key in self.store.list_keys("items")? {
            if let Some(item) = self.store.read::<WorkItem>(&key)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Enqueue new work items at the first stage. Existing ids are left
    /// untouched so seeding is idempotent.
    pub fn seed(&self, entries: &[SeedEntry]) -> Result<u32, PolicywatchError> {
        let mut created = 0;
        for entry in entries {
            let key = ItemKey::new(&entry.company, &entry.policy, &entry.timestamp);
            let store_key = Self::item_store_key(&key.id());
            if self.store.read::<WorkItem>(&store_key)?.is_some() {
                debug!(id = %key.id(), "seed skipped, item exists");
                continue;
            }
            self.put_item(&WorkItem::new(key))?;
            created += 1;
        }
        info!(created, "seeded work items");
        Ok(created)
    }

    /// Crash recovery: items checkpointed as Running belong to a previous
    /// process and are resumed as Retrying. Their attempt record is closed
    /// out so history reflects the interruption.
    pub fn recover(&self) -> Result<u32, PolicywatchError> {
        let mut recovered = 0;
        for mut item in self.load_items()? {
            if item.status == ItemStatus::Running {
                if let Some(attempt) = item.attempts.last_mut()
                    && attempt.finished_at.is_none()
                {
                    attempt.finished_at = Some(Utc::now());
                    attempt.error = Some("interrupted by restart".to_string());
                }
                item.status = ItemStatus::Retrying;
                item.updated_at = Utc::now();
                self.put_item(&item)?;
                recovered += 1;
                warn!(id = %item.id(), "recovered in-flight item");
            }
        }
        Ok(recovered)
    }

    /// Run one pass over every stage in pipeline order.
    pub async fn run_pipeline(&self) -> Result<Vec<(Stage, StageReport)>, PolicywatchError> {
        let mut reports = Vec::new();
        for stage in Stage::ALL {
            reports.push((stage, self.run_stage(stage).await?));
        }
        Ok(reports)
    }

    /// Fan out one driver per eligible item. A single item failing never
    /// blocks or aborts its siblings.
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport, PolicywatchError> {
        let eligible: Vec<WorkItem> = self
            .load_items()?
            .into_iter()
            .filter(|item| item.eligible_for(stage))
            .collect();

        if eligible.is_empty() {
            return Ok(StageReport::default());
        }
        info!(%stage, count = eligible.len(), "dispatching stage");

        let drivers = eligible.into_iter().map(|item| {
            let id = item.id();
            async move { (id, self.drive_item(item).await) }
        });

        let mut report = StageReport::default();
        for (id, result) in join_all(drivers).await {
            match result {
                Ok(DriveResult::Succeeded) => report.succeeded.push(id),
                Ok(DriveResult::Failed(reason)) => report.failed.push((id, reason)),
                Ok(DriveResult::Deferred(reason)) => report.deferred.push((id, reason)),
                Err(e @ PolicywatchError::FatalConfig(_)) => return Err(e),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        Ok(report)
    }

    async fn drive_item(&self, mut item: WorkItem) -> Result<DriveResult, PolicywatchError> {
        let stage = item.stage;
        let workflow = stage.workflow();
        let wf = self.config.workflow(workflow)?.clone();
        let budget = self.config.budget(stage.resource())?.clone();
        let request = ActivityRequest::for_item(&item);

        loop {
            // Fail fast while the breaker is open; the item stays eligible
            // for a later pass, after cooldown or a manual reset.
            if let Some(deferral) = self.breaker_gate(&mut item, workflow)? {
                return Ok(deferral);
            }

            // Poll admission until the budget admits us or patience runs out.
            let mut defers = 0;
            loop {
                match self.limiter.admit(stage.resource(), wf.cost, &budget)? {
                    Admission::Granted => break,
                    Admission::Deferred { wait_hint } => {
                        defers += 1;
                        if defers > wf.max_defers {
                            return Ok(self.defer(&mut item, "admission budget exhausted")?);
                        }
                        let throttle = Duration::from_millis(wf.throttle_delay_ms);
                        sleep(wait_hint.min(throttle)).await;
                    }
                }
            }

            // The breaker may have tripped while we waited for admission.
            if let Some(deferral) = self.breaker_gate(&mut item, workflow)? {
                return Ok(deferral);
            }

            // Checkpoint before the suspension point: a crash from here on
            // resumes this attempt as Retrying instead of losing it.
            let attempt_no = item.stage_attempts() + 1;
            item.attempts.push(AttemptRecord {
                attempt: attempt_no,
                stage,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
            });
            item.status = ItemStatus::Running;
            item.updated_at = Utc::now();
            self.put_item(&item)?;

            let timeout = Duration::from_millis(wf.activity_timeout_ms);
            let outcome = match tokio::time::timeout(timeout, self.executor.execute(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(ActivityFailure::Timeout),
            };

            match outcome {
                Ok(output) => match self.finalize(&mut item, &output) {
                    Ok(run_id) => {
                        self.breakers.record_success(workflow)?;
                        self.close_attempt(&mut item, None);
                        item.advance(run_id, Utc::now());
                        self.put_item(&item)?;
                        info!(id = %item.id(), %stage, "stage succeeded");
                        return Ok(DriveResult::Succeeded);
                    }
                    Err(e) => {
                        // Schema drift is a correlated failure: it counts
                        // toward the breaker like any outage would.
                        let reason = e.to_string();
                        self.breakers.record_failure(workflow, &reason)?;
                        self.fail_item(&mut item, &reason)?;
                        return Ok(DriveResult::Failed(reason));
                    }
                },
                Err(failure) if failure.is_retryable() => {
                    let reason = failure.to_string();
                    self.breakers.record_failure(workflow, &reason)?;
                    self.close_attempt(&mut item, Some(reason.clone()));

                    if attempt_no >= wf.max_attempts {
                        self.fail_item(&mut item, &reason)?;
                        return Ok(DriveResult::Failed(reason));
                    }

                    item.status = ItemStatus::Retrying;
                    item.last_error = Some(reason.clone());
                    item.updated_at = Utc::now();
                    self.put_item(&item)?;

                    let delay = retry_delay(&wf, attempt_no, &failure);
                    warn!(id = %item.id(), attempt = attempt_no, max = wf.max_attempts, %reason, "retrying after backoff");
                    sleep(delay).await;
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    // Validation counts toward the breaker (correlated
                    // schema drift); Fatal is our misconfiguration, not
                    // collaborator health.
                    if matches!(failure, ActivityFailure::Validation(_)) {
                        self.breakers.record_failure(workflow, &reason)?;
                    }
                    self.fail_item(&mut item, &reason)?;
                    return Ok(DriveResult::Failed(reason));
                }
            }
        }
    }

    fn breaker_gate(
        &self,
        item: &mut WorkItem,
        workflow: &str,
    ) -> Result<Option<DriveResult>, PolicywatchError> {
        match self.breakers.check(workflow)? {
            BreakerDecision::Allow | BreakerDecision::Probe => Ok(None),
            BreakerDecision::Deny { retry_after } => {
                let reason = format!(
                    "circuit open for {workflow}, retry in {}s",
                    retry_after.as_secs()
                );
                Ok(Some(self.defer(item, &reason)?))
            }
        }
    }

    fn defer(&self, item: &mut WorkItem, reason: &str) -> Result<DriveResult, PolicywatchError> {
        item.last_error = Some(reason.to_string());
        item.updated_at = Utc::now();
        self.put_item(item)?;
        debug!(id = %item.id(), reason, "item deferred");
        Ok(DriveResult::Deferred(reason.to_string()))
    }

    fn close_attempt(&self, item: &mut WorkItem, error: Option<String>) {
        if let Some(attempt) = item.attempts.last_mut() {
            attempt.finished_at = Some(Utc::now());
            attempt.error = error;
        }
    }

    fn fail_item(&self, item: &mut WorkItem, reason: &str) -> Result<(), PolicywatchError> {
        self.close_attempt(item, Some(reason.to_string()));
        item.status = ItemStatus::Failed;
        item.last_error = Some(reason.to_string());
        item.updated_at = Utc::now();
        self.put_item(item)?;
        warn!(id = %item.id(), stage = %item.stage, reason, "item failed");
        Ok(())
    }

    /// Persist the output and validate it. The raw payload is written before
    /// validation runs, so a failing payload is retained for later
    /// re-validation once the root cause is fixed. The producer's declared
    /// `is_chunked` flag is authoritative; payload shape is never sniffed.
    fn finalize(&self, item: &WorkItem, output: &ActivityOutput) -> Result<String, PolicywatchError> {
        let stage = item.stage;
        let parsed = ChunkEnvelope::<Value>::from_wire(&output.payload, output.is_chunked);
        let part_count = parsed.as_ref().map(|env| env.part_count()).unwrap_or(1);

        let meta = RunMetadata::new(&output.schema_version, &output.prompt_version, part_count);
        self.artifacts.write_run(&item.key, stage, &output.payload, &meta)?;

        let envelope = parsed?;
        if let Some(module) = stage.schema_module() {
            self.registry
                .validate_parts(module, &output.schema_version, envelope.parts())?;
        }
        Ok(meta.run_id)
    }

    /// Re-validate a stored payload against exactly its recorded schema
    /// version. Same payload, same version, same verdict — every time.
    pub fn revalidate(&self, key: &ItemKey, stage: Stage) -> Result<bool, PolicywatchError> {
        let module = stage.schema_module().ok_or_else(|| {
            PolicywatchError::Config(format!("stage {stage} has no schema-governed output"))
        })?;
        let (payload, meta) = self
            .artifacts
            .read_latest(key, stage)?
            .ok_or_else(|| PolicywatchError::ItemNotFound(key.id()))?;

        let envelope = ChunkEnvelope::<Value>::from_wire(&payload, meta.is_chunked)?;
        match self.registry.validate_parts(module, &meta.schema_version, envelope.parts()) {
            Ok(()) => Ok(true),
            Err(PolicywatchError::Validation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pending/running view filtered by workflow type and status.
    pub fn query(
        &self,
        workflow: Option<&str>,
        status: Option<ItemStatus>,
    ) -> Result<Vec<WorkItem>, PolicywatchError> {
        Ok(self
            .load_items()?
            .into_iter()
            .filter(|item| workflow.is_none_or(|w| item.stage.workflow() == w))
            .filter(|item| status.is_none_or(|s| item.status == s))
            .collect())
    }

    /// Stop all pending/running work for a workflow type. Pending and
    /// Retrying items cancel immediately; Running items cancel once the
    /// grace period since their last checkpoint has elapsed, otherwise they
    /// are reported as draining.
    pub fn cancel(&self, workflow: &str) -> Result<CancelReport, PolicywatchError> {
        let grace = chrono::Duration::milliseconds(self.config.cancel_grace_ms as i64);
        let now = Utc::now();
        let mut report = CancelReport::default();

        for mut item in self.load_items()? {
            if item.stage.workflow() != workflow {
                continue;
            }
            match item.status {
                ItemStatus::Pending | ItemStatus::Retrying => {
                    item.status = ItemStatus::Cancelled;
                    item.updated_at = now;
                    self.put_item(&item)?;
                    report.cancelled.push(item.id());
                }
                ItemStatus::Running => {
                    if now - item.updated_at >= grace {
                        self.close_attempt(&mut item, Some("cancelled by operator".to_string()));
                        item.status = ItemStatus::Cancelled;
                        item.updated_at = now;
                        self.put_item(&item)?;
                        report.cancelled.push(item.id());
                    } else {
                        report.draining.push(item.id());
                    }
                }
                _ => {}
            }
        }
        info!(workflow, cancelled = report.cancelled.len(), draining = report.draining.len(), "cancel command processed");
        Ok(report)
    }
}

fn retry_delay(wf: &WorkflowConfig, attempt: u32, failure: &ActivityFailure) -> Duration {
    let backoff = wf.delay_for_attempt(attempt);
    let floor = match failure {
        // Honor the remote's own hint when it gave one.
        ActivityFailure::RateLimited { retry_after_ms } => *retry_after_ms,
        _ => 0,
    };
    Duration::from_millis(backoff.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ResourceBudget};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn summary_payload() -> String {
        serde_json::json!({
            "legally_substantive": {"rating": true, "explanation": "clause added"},
            "practically_substantive": {"rating": false, "explanation": "none"},
            "change_keywords": ["arbitration"],
            "subject_keywords": ["disputes"]
        })
        .to_string()
    }

    fn judge_payload() -> String {
        serde_json::json!({
            "practically_substantive": {"rating": true, "reason": "matches diff"}
        })
        .to_string()
    }

    fn ok_output(stage: Stage) -> ActivityOutput {
        let payload = match stage {
            Stage::Summarize => summary_payload(),
            Stage::Judge => judge_payload(),
            _ => serde_json::json!({"blob": "raw stage output"}).to_string(),
        };
        ActivityOutput {
            payload,
            schema_version: "v1".into(),
            prompt_version: "p1".into(),
            is_chunked: false,
        }
    }

    /// Executor scripted per item id: pops queued results, then succeeds.
    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<HashMap<String, Vec<ActivityFailure>>>,
        overrides: Mutex<HashMap<String, ActivityOutput>>,
        calls: AtomicU32,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        fn fail_times(&self, id: &str, failure: ActivityFailure, times: usize) {
            self.script
                .lock()
                .unwrap()
                .insert(id.to_string(), vec![failure; times]);
        }

        fn override_output(&self, id: &str, output: ActivityOutput) {
            self.overrides.lock().unwrap().insert(id.to_string(), output);
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ActivityExecutor for ScriptedExecutor {
        async fn execute(&self, req: &ActivityRequest) -> Result<ActivityOutput, ActivityFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if let Some(queue) = script.get_mut(&req.item_id)
                && !queue.is_empty()
            {
                return Err(queue.remove(0));
            }
            drop(script);
            if let Some(output) = self.overrides.lock().unwrap().get(&req.item_id) {
                return Ok(output.clone());
            }
            Ok(ok_output(req.stage))
        }
    }

    fn test_config() -> PolicywatchConfig {
        let mut config = PolicywatchConfig::default();
        let wf = WorkflowConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
            throttle_delay_ms: 1,
            max_defers: 3,
            activity_timeout_ms: 5_000,
            cost: 1,
        };
        for workflow in ["scraper", "parser", "differ", "summarizer", "judge"] {
            config.workflows.insert(workflow.to_string(), wf.clone());
        }
        for resource in ["scrape-api", "llm", "local"] {
            config
                .resources
                .insert(resource.to_string(), ResourceBudget { capacity: 1000, window_secs: 60 });
        }
        config.breaker = BreakerConfig {
            threshold: 100,
            cooldown_ms: 60_000,
            cooldown_cap_ms: 120_000,
            probe_count: 1,
            failure_decay_ms: 60_000,
        };
        config
    }

    fn scheduler_with(
        dir: &tempfile::TempDir,
        config: PolicywatchConfig,
        executor: ScriptedExecutor,
    ) -> Scheduler<ScriptedExecutor> {
        let store = Arc::new(FileStore::open(dir.path().join("state")).unwrap());
        let artifacts = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        Scheduler::new(config, store, artifacts, SchemaRegistry::builtin(), executor)
    }

    fn seeds(n: usize) -> Vec<SeedEntry> {
        (0..n)
            .map(|i| SeedEntry {
                company: format!("company-{i}"),
                policy: "tos".into(),
                timestamp: "20260101".into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_walks_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler_with(&dir, test_config(), ScriptedExecutor::default());
        assert_eq!(sched.seed(&seeds(1)).unwrap(), 1);

        let reports = sched.run_pipeline().await.unwrap();
        assert!(reports.iter().all(|(_, r)| r.failed.is_empty()));

        let item = sched.get_item("company-0/tos/20260101").unwrap();
        assert_eq!(item.status, ItemStatus::Succeeded);
        assert_eq!(item.completed.len(), 5);

        // Summarize output landed with metadata.
        let (payload, meta) = sched
            .artifacts
            .read_latest(&item.key, Stage::Summarize)
            .unwrap()
            .unwrap();
        assert!(payload.contains("legally_substantive"));
        assert_eq!(meta.schema_version, "v1");
        assert!(!meta.is_chunked);
    }

    #[test]
    fn seed_entry_parses_three_part_ids() {
        let entry = SeedEntry::parse_id("acme/tos/20260101").unwrap();
        assert_eq!(entry.company, "acme");
        assert_eq!(entry.policy, "tos");
        assert_eq!(entry.timestamp, "20260101");
        assert!(SeedEntry::parse_id("acme/tos").is_err());
        assert!(SeedEntry::parse_id("acme//20260101").is_err());
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler_with(&dir, test_config(), ScriptedExecutor::default());
        assert_eq!(sched.seed(&seeds(2)).unwrap(), 2);
        assert_eq!(sched.seed(&seeds(2)).unwrap(), 0);
    }

    #[tokio::test]
    async fn one_permanent_failure_leaves_siblings_unharmed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        executor.fail_times(
            "company-1/tos/20260101",
            ActivityFailure::Transient("connection refused".into()),
            10,
        );
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(3)).unwrap();

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);

        let failed = sched.get_item("company-1/tos/20260101").unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.stage_attempts(), 3);
        assert!(failed.last_error.as_deref().unwrap().contains("connection refused"));
        for id in ["company-0/tos/20260101", "company-2/tos/20260101"] {
            let item = sched.get_item(id).unwrap();
            assert!(item.has_completed(Stage::Snapshot));
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        executor.fail_times(
            "company-0/tos/20260101",
            ActivityFailure::Transient("blip".into()),
            1,
        );
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);

        let item = sched.get_item("company-0/tos/20260101").unwrap();
        // Attempt history is append-only: the failed try is still there.
        let snapshot_attempts: Vec<_> =
            item.attempts.iter().filter(|a| a.stage == Stage::Snapshot).collect();
        assert_eq!(snapshot_attempts.len(), 2);
        assert_eq!(snapshot_attempts[0].error.as_deref(), Some("Transient failure: blip"));
        assert!(snapshot_attempts[1].error.is_none());
    }

    #[tokio::test]
    async fn open_breaker_denies_without_external_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.breaker.threshold = 3;
        let sched = scheduler_with(&dir, config, ScriptedExecutor::default());
        sched.seed(&seeds(1)).unwrap();

        for _ in 0..3 {
            sched.breakers.record_failure("scraper", "outage").unwrap();
        }

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(sched.executor.call_count(), 0);

        // Manual reset lets the next pass through.
        sched.breakers.reset("scraper").unwrap();
        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_for_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.workflows.get_mut("scraper").unwrap().activity_timeout_ms = 20;
        config.workflows.get_mut("scraper").unwrap().max_attempts = 1;
        let executor = ScriptedExecutor { delay: Some(Duration::from_millis(200)), ..Default::default() };
        let sched = scheduler_with(&dir, config, executor);
        sched.seed(&seeds(1)).unwrap();

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.failed.len(), 1);

        let rec = sched.breakers.status("scraper").unwrap().unwrap();
        assert_eq!(rec.failures, 1);
        assert!(rec.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn crash_recovery_resumes_in_flight_and_skips_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler_with(&dir, test_config(), ScriptedExecutor::default());
        sched.seed(&seeds(2)).unwrap();

        // First item fully through Snapshot.
        sched.run_stage(Stage::Snapshot).await.unwrap();
        let calls_after_first_pass = sched.executor.call_count();

        // Simulate a crash mid-dispatch on the second item.
        let mut crashed = sched.get_item("company-1/tos/20260101").unwrap();
        crashed.stage = Stage::Parse;
        crashed.status = ItemStatus::Running;
        crashed.attempts.push(AttemptRecord {
            attempt: 1,
            stage: Stage::Parse,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        sched.put_item(&crashed).unwrap();

        assert_eq!(sched.recover().unwrap(), 1);
        let recovered = sched.get_item("company-1/tos/20260101").unwrap();
        assert_eq!(recovered.status, ItemStatus::Retrying);
        assert_eq!(
            recovered.attempts.last().unwrap().error.as_deref(),
            Some("interrupted by restart")
        );

        // Snapshot already succeeded for both: re-running it dispatches nothing.
        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(sched.executor.call_count(), calls_after_first_pass);

        // The recovered item finishes its stage.
        let report = sched.run_stage(Stage::Parse).await.unwrap();
        assert!(report.succeeded.contains(&"company-1/tos/20260101".to_string()));
    }

    #[tokio::test]
    async fn invalid_output_fails_item_but_retains_raw_payload() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();

        // Walk to the Summarize stage.
        for stage in [Stage::Snapshot, Stage::Parse, Stage::Diff] {
            sched.run_stage(stage).await.unwrap();
        }
        sched.executor.override_output(
            "company-0/tos/20260101",
            ActivityOutput {
                payload: r#"{"surprise": "wrong shape"}"#.to_string(),
                schema_version: "v1".into(),
                prompt_version: "p1".into(),
                is_chunked: false,
            },
        );

        let report = sched.run_stage(Stage::Summarize).await.unwrap();
        assert_eq!(report.failed.len(), 1);

        let item = sched.get_item("company-0/tos/20260101").unwrap();
        assert_eq!(item.status, ItemStatus::Failed);

        // Raw payload retained for reprocessing; replay reports it invalid.
        let (raw, _meta) = sched.artifacts.read_latest(&item.key, Stage::Summarize).unwrap().unwrap();
        assert!(raw.contains("surprise"));
        assert!(!sched.revalidate(&item.key, Stage::Summarize).unwrap());
    }

    #[tokio::test]
    async fn unregistered_schema_version_fails_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();
        for stage in [Stage::Snapshot, Stage::Parse, Stage::Diff] {
            sched.run_stage(stage).await.unwrap();
        }
        sched.executor.override_output(
            "company-0/tos/20260101",
            ActivityOutput {
                payload: summary_payload(),
                schema_version: "v99".into(),
                prompt_version: "p1".into(),
                is_chunked: false,
            },
        );

        let report = sched.run_stage(Stage::Summarize).await.unwrap();
        let (_, reason) = &report.failed[0];
        assert!(reason.contains("No schema registered"));
    }

    #[tokio::test]
    async fn chunked_output_validates_each_part_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();
        for stage in [Stage::Snapshot, Stage::Parse, Stage::Diff] {
            sched.run_stage(stage).await.unwrap();
        }
        let chunked = format!(r#"{{"chunks": [{0}, {0}]}}"#, summary_payload());
        sched.executor.override_output(
            "company-0/tos/20260101",
            ActivityOutput {
                payload: chunked,
                schema_version: "v1".into(),
                prompt_version: "p1".into(),
                is_chunked: true,
            },
        );

        let report = sched.run_stage(Stage::Summarize).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);

        let key = ItemKey::new("company-0", "tos", "20260101");
        let (_, meta) = sched.artifacts.read_latest(&key, Stage::Summarize).unwrap().unwrap();
        assert!(meta.is_chunked);
        assert_eq!(meta.part_count, 2);
        assert!(sched.revalidate(&key, Stage::Summarize).unwrap());
    }

    #[tokio::test]
    async fn declared_chunking_flag_is_authoritative_over_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();

        // A snapshot blob that merely looks chunked; the producer says it
        // is a single part, and the producer is right.
        sched.executor.override_output(
            "company-0/tos/20260101",
            ActivityOutput {
                payload: r#"{"chunks": [{"html": "a"}, {"html": "b"}]}"#.to_string(),
                schema_version: "v1".into(),
                prompt_version: "p1".into(),
                is_chunked: false,
            },
        );

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.succeeded.len(), 1);

        let key = ItemKey::new("company-0", "tos", "20260101");
        let (_, meta) = sched.artifacts.read_latest(&key, Stage::Snapshot).unwrap().unwrap();
        assert!(!meta.is_chunked);
        assert_eq!(meta.part_count, 1);
    }

    #[tokio::test]
    async fn cancel_stops_pending_and_respects_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.cancel_grace_ms = 60_000;
        let sched = scheduler_with(&dir, config, ScriptedExecutor::default());
        sched.seed(&seeds(3)).unwrap();

        // One item freshly running, one stale-running, one pending.
        let mut fresh = sched.get_item("company-0/tos/20260101").unwrap();
        fresh.status = ItemStatus::Running;
        fresh.updated_at = Utc::now();
        sched.put_item(&fresh).unwrap();

        let mut stale = sched.get_item("company-1/tos/20260101").unwrap();
        stale.status = ItemStatus::Running;
        stale.updated_at = Utc::now() - chrono::Duration::milliseconds(120_000);
        sched.put_item(&stale).unwrap();

        let report = sched.cancel("scraper").unwrap();
        assert_eq!(report.draining, vec!["company-0/tos/20260101".to_string()]);
        assert_eq!(report.cancelled.len(), 2);

        assert_eq!(
            sched.get_item("company-1/tos/20260101").unwrap().status,
            ItemStatus::Cancelled
        );
        assert_eq!(
            sched.get_item("company-2/tos/20260101").unwrap().status,
            ItemStatus::Cancelled
        );
        // Cancelled items are no longer eligible.
        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn query_filters_by_workflow_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler_with(&dir, test_config(), ScriptedExecutor::default());
        sched.seed(&seeds(2)).unwrap();
        sched.run_stage(Stage::Snapshot).await.unwrap();

        // Both items now sit at Parse.
        assert_eq!(sched.query(Some("parser"), Some(ItemStatus::Pending)).unwrap().len(), 2);
        assert!(sched.query(Some("scraper"), None).unwrap().is_empty());
        assert_eq!(sched.query(None, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fatal_failure_does_not_strike_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        executor.fail_times(
            "company-0/tos/20260101",
            ActivityFailure::Fatal("bad endpoint".into()),
            1,
        );
        let sched = scheduler_with(&dir, test_config(), executor);
        sched.seed(&seeds(1)).unwrap();

        let report = sched.run_stage(Stage::Snapshot).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(sched.executor.call_count(), 1);
        assert_eq!(sched.breakers.status("scraper").unwrap().unwrap().failures, 0);
    }
}
