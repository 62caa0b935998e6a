//! Terminal output — spinners and colored summaries.
//!
//! Uses `indicatif` for progress spinners and `console` for color styling.
//! [`StageProgress`] tracks one stage pass visually; the free functions
//! render status tables for items and breakers.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::breaker::{BreakerRecord, BreakerState};
use crate::item::{ItemStatus, Stage, WorkItem};
use crate::scheduler::{CancelReport, StageReport};

/// Visual progress indicator for one stage pass over the work set.
pub struct StageProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl StageProgress {
    pub fn start(stage: Stage) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("{stage}: dispatching eligible items"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finish the spinner and print the pass outcome, failures one per line.
    pub fn complete(&self, stage: Stage, report: &StageReport) {
        self.pb.finish_and_clear();
        if report.is_empty() {
            println!("  {stage}: nothing eligible");
            return;
        }
        println!(
            "  {stage}: {} succeeded, {} failed, {} deferred",
            self.green.apply_to(report.succeeded.len()),
            self.red.apply_to(report.failed.len()),
            self.yellow.apply_to(report.deferred.len()),
        );
        for (id, reason) in &report.failed {
            println!("    {} {id}: {reason}", self.red.apply_to("✗"));
        }
        for (id, reason) in &report.deferred {
            println!("    {} {id}: {reason}", self.yellow.apply_to("↻"));
        }
    }
}

/// One line per item: id, stage, status, last error if any.
pub fn print_items(items: &[WorkItem]) {
    if items.is_empty() {
        println!("No matching work items.");
        return;
    }
    let green = Style::new().green();
    let red = Style::new().red();
    let yellow = Style::new().yellow();
    for item in items {
        let status = item.status.to_string();
        let styled = match item.status {
            ItemStatus::Succeeded => green.apply_to(status),
            ItemStatus::Failed => red.apply_to(status),
            _ => yellow.apply_to(status),
        };
        match &item.last_error {
            Some(error) => println!("  {:<40} {} [{styled}] — {error}", item.id(), item.stage),
            None => println!("  {:<40} {} [{styled}]", item.id(), item.stage),
        }
    }
}

pub fn print_breaker(workflow: &str, record: &BreakerRecord) {
    let style = match record.state {
        BreakerState::Closed => Style::new().green(),
        BreakerState::Open => Style::new().red().bold(),
        BreakerState::HalfOpen => Style::new().yellow(),
    };
    println!(
        "  {:<12} {:<10} failures={} cooldown={}ms",
        workflow,
        style.apply_to(record.state),
        record.failures,
        record.cooldown_ms,
    );
    if let Some(error) = &record.last_error {
        println!("    last error: {error}");
    }
}

pub fn print_cancel(workflow: &str, report: &CancelReport) {
    println!(
        "Cancelled {} item(s) for {workflow}",
        Style::new().red().apply_to(report.cancelled.len())
    );
    for id in &report.draining {
        println!(
            "  {} {id} still running, within grace period",
            Style::new().yellow().apply_to("…")
        );
    }
}
