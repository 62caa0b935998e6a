use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five pipeline stages a document snapshot moves through.
///
/// Each item flows: SNAPSHOT → PARSE → DIFF → SUMMARIZE → JUDGE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Snapshot,
    Parse,
    Diff,
    Summarize,
    Judge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Snapshot,
        Stage::Parse,
        Stage::Diff,
        Stage::Summarize,
        Stage::Judge,
    ];

    /// The stage after this one, or `None` at the end of the pipeline.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Snapshot => Some(Stage::Parse),
            Stage::Parse => Some(Stage::Diff),
            Stage::Diff => Some(Stage::Summarize),
            Stage::Summarize => Some(Stage::Judge),
            Stage::Judge => None,
        }
    }

    /// Workflow type for breaker keying. Failures correlate per workflow
    /// (shared cause: resource outage, schema drift), not per item.
    pub fn workflow(self) -> &'static str {
        match self {
            Stage::Snapshot => "scraper",
            Stage::Parse => "parser",
            Stage::Diff => "differ",
            Stage::Summarize => "summarizer",
            Stage::Judge => "judge",
        }
    }

    /// Shared resource this stage draws its admission budget from.
    pub fn resource(self) -> &'static str {
        match self {
            Stage::Snapshot => "scrape-api",
            Stage::Parse | Stage::Diff => "local",
            Stage::Summarize | Stage::Judge => "llm",
        }
    }

    /// Directory prefix for artifacts produced by this stage.
    pub fn artifact_dir(self) -> &'static str {
        match self {
            Stage::Snapshot => "01-snapshots",
            Stage::Parse => "02-doctrees",
            Stage::Diff => "03-diffs",
            Stage::Summarize => "04-summaries",
            Stage::Judge => "05-judgments",
        }
    }

    /// Schema module validated at this stage, if the stage produces a
    /// schema-governed output.
    pub fn schema_module(self) -> Option<&'static str> {
        match self {
            Stage::Summarize => Some("summary"),
            Stage::Judge => Some("judge"),
            _ => None,
        }
    }

    pub fn from_workflow(workflow: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.workflow() == workflow)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Snapshot => write!(f, "SNAPSHOT"),
            Stage::Parse => write!(f, "PARSE"),
            Stage::Diff => write!(f, "DIFF"),
            Stage::Summarize => write!(f, "SUMMARIZE"),
            Stage::Judge => write!(f, "JUDGE"),
        }
    }
}

/// Tracks the lifecycle status of a work item within its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Retrying => "retrying",
            ItemStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Identity of one monitored document snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemKey {
    pub company: String,
    pub policy: String,
    pub timestamp: String,
}

impl ItemKey {
    pub fn new(company: impl Into<String>, policy: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            policy: policy.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Stable id used for store keys and artifact paths.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.company, self.policy, self.timestamp)
    }
}

/// One dispatch attempt. Appended, never rewritten: retries grow the list so
/// the full history stays queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Durable record that a stage completed for this item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub run_id: String,
    pub succeeded_at: DateTime<Utc>,
}

/// A single unit of pipeline work: one document snapshot at one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: ItemKey,
    pub stage: Stage,
    pub status: ItemStatus,
    pub attempts: Vec<AttemptRecord>,
    pub completed: Vec<StageRecord>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(key: ItemKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            stage: Stage::Snapshot,
            status: ItemStatus::Pending,
            attempts: Vec::new(),
            completed: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> String {
        self.key.id()
    }

    /// Attempts made within the current stage.
    pub fn stage_attempts(&self) -> u32 {
        self.attempts.iter().filter(|a| a.stage == self.stage).count() as u32
    }

    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed.iter().any(|r| r.stage == stage)
    }

    /// Record durable success of the current stage and move the item forward.
    /// At the last stage the item becomes terminally Succeeded.
    pub fn advance(&mut self, run_id: String, now: DateTime<Utc>) {
        self.completed.push(StageRecord {
            stage: self.stage,
            run_id,
            succeeded_at: now,
        });
        self.last_error = None;
        self.updated_at = now;
        match self.stage.next() {
            Some(next) => {
                self.stage = next;
                self.status = ItemStatus::Pending;
            }
            None => self.status = ItemStatus::Succeeded,
        }
    }

    /// Whether the scheduler may dispatch this item for the given stage.
    /// Guards both stage-skipping and re-entering a completed stage.
    pub fn eligible_for(&self, stage: Stage) -> bool {
        self.stage == stage
            && !self.has_completed(stage)
            && matches!(self.status, ItemStatus::Pending | ItemStatus::Retrying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_covers_pipeline() {
        let mut stage = Stage::Snapshot;
        let mut walked = vec![stage];
        while let Some(next) = stage.next() {
            walked.push(next);
            stage = next;
        }
        assert_eq!(walked, Stage::ALL.to_vec());
    }

    #[test]
    fn stage_resources_are_split() {
        assert_eq!(Stage::Snapshot.resource(), "scrape-api");
        assert_eq!(Stage::Summarize.resource(), "llm");
        assert_eq!(Stage::Judge.resource(), "llm");
        assert_ne!(Stage::Snapshot.resource(), Stage::Summarize.resource());
    }

    #[test]
    fn workflow_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_workflow(stage.workflow()), Some(stage));
        }
        assert_eq!(Stage::from_workflow("nope"), None);
    }

    #[test]
    fn item_creation_defaults() {
        let item = WorkItem::new(ItemKey::new("acme", "tos", "20260101"));
        assert_eq!(item.stage, Stage::Snapshot);
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.attempts.is_empty());
        assert!(item.completed.is_empty());
        assert_eq!(item.id(), "acme/tos/20260101");
    }

    #[test]
    fn advance_walks_stages_and_terminates() {
        let mut item = WorkItem::new(ItemKey::new("acme", "tos", "20260101"));
        for _ in 0..4 {
            item.advance("run".into(), Utc::now());
            assert_eq!(item.status, ItemStatus::Pending);
        }
        assert_eq!(item.stage, Stage::Judge);
        item.advance("run".into(), Utc::now());
        assert_eq!(item.status, ItemStatus::Succeeded);
        assert_eq!(item.completed.len(), 5);
    }

    #[test]
    fn completed_stage_is_never_eligible_again() {
        let mut item = WorkItem::new(ItemKey::new("acme", "tos", "20260101"));
        assert!(item.eligible_for(Stage::Snapshot));
        // Cannot skip ahead.
        assert!(!item.eligible_for(Stage::Diff));

        item.advance("run".into(), Utc::now());
        assert!(item.has_completed(Stage::Snapshot));
        assert!(!item.eligible_for(Stage::Snapshot));
        assert!(item.eligible_for(Stage::Parse));
    }

    #[test]
    fn stage_attempts_counts_only_current_stage() {
        let mut item = WorkItem::new(ItemKey::new("acme", "tos", "20260101"));
        item.attempts.push(AttemptRecord {
            attempt: 1,
            stage: Stage::Snapshot,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        });
        assert_eq!(item.stage_attempts(), 1);
        item.advance("run".into(), Utc::now());
        assert_eq!(item.stage_attempts(), 0);
    }

    #[test]
    fn item_serialization_roundtrip() {
        let item = WorkItem::new(ItemKey::new("acme", "privacy", "20260401"));
        let json = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, item.key);
        assert_eq!(back.stage, Stage::Snapshot);
        assert_eq!(back.status, ItemStatus::Pending);
    }
}
