//! clap-based command-line interface.
//!
//! Defines the [`Cli`] struct with subcommands [`Command`] (seed, run,
//! status, breaker, cancel, replay) and global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::item::{ItemStatus, Stage};

/// policywatch — pipeline control plane for ToS change monitoring.
#[derive(Debug, Parser)]
#[command(name = "policywatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "policywatch.toml")]
    pub config: PathBuf,

    /// Enable verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Stage argument accepted by the CLI, mapped to [`Stage`] internally.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StageArg {
    /// Fetch the raw document snapshot.
    Snapshot,
    /// Extract a document tree from the snapshot.
    Parse,
    /// Diff against the previous version.
    Diff,
    /// LLM summary of the change.
    Summarize,
    /// LLM judgement of practical substance.
    Judge,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Snapshot => Stage::Snapshot,
            StageArg::Parse => Stage::Parse,
            StageArg::Diff => Stage::Diff,
            StageArg::Summarize => Stage::Summarize,
            StageArg::Judge => Stage::Judge,
        }
    }
}

/// Status filter accepted by the CLI, mapped to [`ItemStatus`] internally.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl From<StatusArg> for ItemStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => ItemStatus::Pending,
            StatusArg::Running => ItemStatus::Running,
            StatusArg::Succeeded => ItemStatus::Succeeded,
            StatusArg::Failed => ItemStatus::Failed,
            StatusArg::Retrying => ItemStatus::Retrying,
            StatusArg::Cancelled => ItemStatus::Cancelled,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue document snapshots as pipeline work items.
    Seed {
        /// Item ids of the form company/policy/timestamp.
        ids: Vec<String>,

        /// Path to a TOML file containing seed entries.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run the pipeline over all eligible items.
    Run {
        /// Run only this stage instead of the full pipeline.
        #[arg(long)]
        stage: Option<StageArg>,
    },

    /// Show work item status.
    Status {
        /// Only items currently in this workflow type.
        #[arg(long)]
        workflow: Option<String>,

        /// Only items in this state.
        #[arg(long)]
        state: Option<StatusArg>,
    },

    /// Inspect or reset circuit breakers.
    Breaker {
        #[command(subcommand)]
        command: BreakerCommand,
    },

    /// Cancel all pending and running work for a workflow type.
    Cancel {
        /// Workflow type to cancel (scraper, parser, differ, summarizer, judge).
        workflow: String,
    },

    /// Re-validate a stored stage output against its recorded schema version.
    Replay {
        /// Item id of the form company/policy/timestamp.
        id: String,

        /// Stage whose output to re-validate.
        #[arg(long)]
        stage: StageArg,
    },
}

#[derive(Debug, Subcommand)]
pub enum BreakerCommand {
    /// Show breaker state for every workflow type seen so far.
    Status,

    /// Force a breaker back to Closed.
    Reset {
        /// Workflow type whose breaker to reset.
        workflow: String,
    },
}
