//! CSV and JSON exports of run and correction results.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use theta_core::corrector::{PartitionOutcome, ReportSet};

use crate::engine::RunSummary;

fn date_cell(date: Option<chrono::NaiveDate>) -> String {
    date.map(|d| d.format("%Y%m%d").to_string()).unwrap_or_default()
}

/// Failed units as CSV.
///
/// Columns: symbol, kind, trade_date, expiration, attempts, error
pub fn export_failures_csv(summary: &RunSummary) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["symbol", "kind", "trade_date", "expiration", "attempts", "error"])?;
    for f in &summary.failures {
        wtr.write_record([
            f.unit.symbol().to_string(),
            f.unit.kind().as_str().to_string(),
            date_cell(Some(f.unit.trade_date())),
            date_cell(f.unit.expiration()),
            f.attempts.to_string(),
            f.error.clone(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per partition visited by a correction pass.
///
/// Columns: path, outcome, rows_examined, rows_repaired, rows_inserted,
/// rows_flagged, rows_unrepairable, gaps_flagged, error
pub fn export_corrections_csv(reports: &ReportSet) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "path",
        "outcome",
        "rows_examined",
        "rows_repaired",
        "rows_inserted",
        "rows_flagged",
        "rows_unrepairable",
        "gaps_flagged",
        "error",
    ])?;
    for result in &reports.results {
        let path = result.path.display().to_string();
        let (outcome, report, error) = match &result.outcome {
            PartitionOutcome::Clean(r) => ("clean", Some(r), String::new()),
            PartitionOutcome::Repaired(r) => ("repaired", Some(r), String::new()),
            PartitionOutcome::Failed { error, quarantined } => (
                if *quarantined { "quarantined" } else { "failed" },
                None,
                error.clone(),
            ),
        };
        let count = |f: fn(&theta_core::corrector::RepairReport) -> usize| {
            report.map(|r| f(r).to_string()).unwrap_or_default()
        };
        wtr.write_record([
            path,
            outcome.to_string(),
            count(|r| r.rows_examined),
            count(|r| r.rows_repaired),
            count(|r| r.rows_inserted),
            count(|r| r.rows_flagged),
            count(|r| r.rows_unrepairable),
            count(|r| r.gaps_flagged),
            error,
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Write `summary.json` and `failures.csv` for a run into `dir`.
///
/// Returns the paths written.
pub fn save_run_report(summary: &RunSummary, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;

    let json_path = dir.join("summary.json");
    let json = serde_json::to_string_pretty(summary).context("failed to serialize summary")?;
    std::fs::write(&json_path, json)
        .with_context(|| format!("failed to write {}", json_path.display()))?;

    let csv_path = dir.join("failures.csv");
    std::fs::write(&csv_path, export_failures_csv(summary)?)
        .with_context(|| format!("failed to write {}", csv_path.display()))?;

    Ok(vec![json_path, csv_path])
}
