//! Progress callbacks for bulk runs.

use theta_core::domain::WorkUnit;

use crate::engine::{RunSummary, UnitReport, UnitState};

/// Receives per-unit progress from engine workers.
///
/// Called concurrently from every worker thread; implementations must not
/// block for long.
pub trait RunProgress: Send + Sync {
    /// Called once the work queue has been built.
    fn on_expanded(&self, _total: usize) {}

    /// Called when a worker picks up a unit.
    fn on_start(&self, unit: &WorkUnit, index: usize, total: usize);

    /// Called when a unit reaches a terminal state.
    fn on_complete(&self, report: &UnitReport, index: usize, total: usize);

    /// Called after every worker has stopped.
    fn on_run_complete(&self, summary: &RunSummary);
}

/// Emits structured `tracing` events. The engine default.
pub struct TracingProgress;

impl RunProgress for TracingProgress {
    fn on_expanded(&self, total: usize) {
        tracing::info!(total, "work queue built");
    }

    fn on_start(&self, unit: &WorkUnit, index: usize, total: usize) {
        tracing::debug!(unit = %unit, index = index + 1, total, "unit started");
    }

    fn on_complete(&self, report: &UnitReport, index: usize, total: usize) {
        match &report.state {
            UnitState::Persisted { rows } => tracing::info!(
                unit = %report.unit,
                rows,
                attempts = report.attempts,
                progress = %format!("{}/{}", index + 1, total),
                "unit persisted"
            ),
            UnitState::Skipped => {
                tracing::debug!(unit = %report.unit, "unit skipped, partition valid")
            }
            UnitState::Failed { error } => tracing::warn!(
                unit = %report.unit,
                attempts = report.attempts,
                error = %error,
                "unit failed"
            ),
            UnitState::Pending | UnitState::InFlight => {}
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        tracing::info!(
            total = summary.total,
            persisted = summary.persisted,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            rows = summary.rows_written,
            "bulk run complete"
        );
    }
}

/// Human-readable progress on stdout.
pub struct StdoutProgress;

impl RunProgress for StdoutProgress {
    fn on_start(&self, unit: &WorkUnit, index: usize, total: usize) {
        println!("[{}/{}] Fetching {unit}...", index + 1, total);
    }

    fn on_complete(&self, report: &UnitReport, _index: usize, _total: usize) {
        match &report.state {
            UnitState::Persisted { rows } => println!("  OK: {} ({rows} rows)", report.unit),
            UnitState::Skipped => println!("  SKIP: {}", report.unit),
            UnitState::Failed { error } => println!("  FAIL: {}: {error}", report.unit),
            UnitState::Pending | UnitState::InFlight => {}
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        println!(
            "\nDownload complete: {}/{} persisted, {} skipped, {} failed, {} cancelled",
            summary.persisted, summary.total, summary.skipped, summary.failed, summary.cancelled
        );
    }
}

/// Discards every callback.
pub struct NoProgress;

impl RunProgress for NoProgress {
    fn on_start(&self, _unit: &WorkUnit, _index: usize, _total: usize) {}
    fn on_complete(&self, _report: &UnitReport, _index: usize, _total: usize) {}
    fn on_run_complete(&self, _summary: &RunSummary) {}
}
