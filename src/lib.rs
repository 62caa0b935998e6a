//! policywatch — durable pipeline control plane for Terms-of-Service change
//! monitoring.
//!
//! A document snapshot moves through five stages (snapshot, parse, diff,
//! summarize, judge). The [`scheduler::Scheduler`] fans out one driver per
//! item, gated by per-workflow [`breaker`]s and per-resource [`limiter`]
//! budgets, and checkpoints everything through the [`store`] so a crash
//! never loses or duplicates work. LLM outputs are validated against the
//! versioned [`schema`] registry and kept as immutable artifacts.

pub mod activity;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod item;
pub mod limiter;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod ui;
