//! Data-integrity corrector for persisted or freshly fetched partitions.
//!
//! Per partition, `zero_repair` fixes rows whose prices are missing:
//! partial rows from their own reference price, then whole rows by
//! re-fetching the series from the terminal (inside the retention window),
//! then by interpolating between valid neighbours. Whatever is left is
//! flagged `Unrepairable`. `gap_fill` then inserts interpolated rows into
//! short runs of missing timestamps.
//!
//! Repairs are idempotent: repaired rows are valid, flagged rows are never
//! revisited, and interpolated rows are never used as anchors. Partial rows
//! completed from their own price are marked `Filled` and do anchor.

pub mod repair;

use crate::client::TerminalSource;
use crate::domain::{Contract, PartitionData, PartitionRows, SeriesRow, WorkUnit};
use crate::store::{PartitionStore, PersistError};
use chrono::{Duration, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("{unit}: all {rows} rows are degenerate and none could be repaired")]
    Unrepairable { unit: WorkUnit, rows: usize },

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Counters from one or more repair passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub rows_examined: usize,
    pub rows_repaired: usize,
    /// Rows still degenerate plus rows missing inside flagged gaps.
    pub rows_unrepairable: usize,
    /// Rows newly marked unrepairable by this pass.
    pub rows_flagged: usize,
    pub rows_inserted: usize,
    pub gaps_flagged: usize,
}

impl RepairReport {
    pub fn merge(&mut self, other: &RepairReport) {
        self.rows_examined += other.rows_examined;
        self.rows_repaired += other.rows_repaired;
        self.rows_unrepairable += other.rows_unrepairable;
        self.rows_flagged += other.rows_flagged;
        self.rows_inserted += other.rows_inserted;
        self.gaps_flagged += other.gaps_flagged;
    }

    /// The partition content differs from what was examined.
    pub fn changed(&self) -> bool {
        self.rows_repaired > 0 || self.rows_flagged > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectorConfig {
    pub expected_interval: Duration,
    /// Longest run of missing intervals `gap_fill` will interpolate.
    pub max_gap_intervals: usize,
    /// How many rows either side of a bad row to search for anchors.
    pub neighbor_window: usize,
    /// Re-fetch only partitions at most this many days old. `None` means no
    /// limit.
    pub refetch_retention_days: Option<i64>,
    /// "Today" for the retention check; defaults to the current UTC date.
    pub reference_date: Option<NaiveDate>,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            expected_interval: Duration::minutes(1),
            max_gap_intervals: 5,
            neighbor_window: 5,
            refetch_retention_days: Some(365),
            reference_date: None,
        }
    }
}

/// What happened to one partition file in a batch pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOutcome {
    Clean(RepairReport),
    Repaired(RepairReport),
    Failed { error: String, quarantined: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResult {
    pub path: PathBuf,
    pub outcome: PartitionOutcome,
}

/// Outcomes of a `batch_correct` pass, sorted by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportSet {
    pub results: Vec<PartitionResult>,
}

impl ReportSet {
    pub fn totals(&self) -> RepairReport {
        let mut total = RepairReport::default();
        for r in &self.results {
            if let PartitionOutcome::Clean(report) | PartitionOutcome::Repaired(report) = &r.outcome
            {
                total.merge(report);
            }
        }
        total
    }

    pub fn partitions(&self) -> usize {
        self.results.len()
    }

    pub fn repaired(&self) -> usize {
        self.count(|o| matches!(o, PartitionOutcome::Repaired(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PartitionOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&PartitionOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn merge(&mut self, other: ReportSet) {
        self.results.extend(other.results);
        self.results.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

fn only_underlying(rows: PartitionRows) -> Option<Vec<crate::domain::OhlcRow>> {
    match rows {
        PartitionRows::Underlying(v) => Some(v),
        _ => None,
    }
}

fn only_option_ohlc(rows: PartitionRows) -> Option<Vec<crate::domain::OptionOhlcRow>> {
    match rows {
        PartitionRows::OptionOhlc(v) => Some(v),
        _ => None,
    }
}

fn only_greeks(rows: PartitionRows) -> Option<Vec<crate::domain::GreeksRow>> {
    match rows {
        PartitionRows::Greeks(v) => Some(v),
        _ => None,
    }
}

pub struct Corrector {
    config: CorrectorConfig,
    source: Option<Arc<dyn TerminalSource>>,
}

impl Corrector {
    pub fn new(config: CorrectorConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    /// Enable re-fetch repairs through `source`.
    pub fn with_source(mut self, source: Arc<dyn TerminalSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &CorrectorConfig {
        &self.config
    }

    fn refetch_allowed(&self, unit: &WorkUnit) -> bool {
        match self.config.refetch_retention_days {
            None => true,
            Some(days) => {
                let today = self
                    .config
                    .reference_date
                    .unwrap_or_else(|| Utc::now().date_naive());
                (today - unit.trade_date()).num_days() <= days
            }
        }
    }

    fn zero_repair_rows<T: SeriesRow>(
        &self,
        unit: &WorkUnit,
        rows: &mut [T],
        extract: fn(PartitionRows) -> Option<Vec<T>>,
        contract_of: fn(&T) -> Option<Contract>,
    ) -> RepairReport {
        let mut report = RepairReport {
            rows_examined: rows.len(),
            ..RepairReport::default()
        };
        repair::repair_partial(rows, &mut report);

        let source = self
            .source
            .as_ref()
            .filter(|_| self.refetch_allowed(unit));
        if let Some(source) = source {
            let refetch = |row: &T| match source.refetch_series(unit, contract_of(row)) {
                Ok(fresh) => extract(fresh),
                Err(e) => {
                    tracing::warn!(unit = %unit, error = %e, "re-fetch failed, falling back to interpolation");
                    None
                }
            };
            repair::repair_by_refetch(rows, refetch, &mut report);
        }

        repair::repair_by_interpolation(rows, self.config.neighbor_window, &mut report);
        report.rows_unrepairable += repair::count_unrepairable(rows);
        report
    }

    /// Repair degenerate and partial rows in place.
    pub fn zero_repair(&self, data: &mut PartitionData) -> RepairReport {
        let unit = &data.unit;
        match &mut data.rows {
            PartitionRows::Underlying(rows) => {
                self.zero_repair_rows(unit, rows, only_underlying, |_| None)
            }
            PartitionRows::OptionOhlc(rows) => {
                self.zero_repair_rows(unit, rows, only_option_ohlc, |r| Some(r.contract))
            }
            PartitionRows::Greeks(rows) => {
                self.zero_repair_rows(unit, rows, only_greeks, |r| Some(r.contract))
            }
        }
    }

    /// Insert interpolated rows into gaps of at most `max_gap_intervals`
    /// missing `expected_interval` steps.
    pub fn gap_fill(&self, data: &mut PartitionData, expected_interval: Duration) -> RepairReport {
        let mut report = RepairReport {
            rows_examined: data.len(),
            ..RepairReport::default()
        };
        let max = self.config.max_gap_intervals;
        match &mut data.rows {
            PartitionRows::Underlying(rows) => {
                repair::fill_gaps(rows, expected_interval, max, &mut report)
            }
            PartitionRows::OptionOhlc(rows) => {
                repair::fill_gaps(rows, expected_interval, max, &mut report)
            }
            PartitionRows::Greeks(rows) => {
                repair::fill_gaps(rows, expected_interval, max, &mut report)
            }
        }
        report
    }

    /// `zero_repair` followed by `gap_fill`. Fails when no row of a
    /// non-empty partition carries valid prices afterwards.
    pub fn correct(&self, data: &mut PartitionData) -> Result<RepairReport, RepairError> {
        let mut report = self.zero_repair(data);
        let rows = data.len();
        if rows > 0 && report.rows_unrepairable == rows {
            return Err(RepairError::Unrepairable {
                unit: data.unit.clone(),
                rows,
            });
        }
        let gaps = self.gap_fill(data, self.config.expected_interval);
        report.rows_repaired += gaps.rows_repaired;
        report.rows_unrepairable += gaps.rows_unrepairable;
        report.rows_inserted += gaps.rows_inserted;
        report.gaps_flagged += gaps.gaps_flagged;
        Ok(report)
    }

    /// Correct one partition file, rewriting it only when something changed.
    pub fn correct_file(&self, path: &Path) -> PartitionOutcome {
        let mut data = match PartitionStore::read_path(path) {
            Ok(data) => data,
            Err(e @ PersistError::CorruptExisting { .. }) => {
                let quarantined = match PartitionStore::quarantine(path) {
                    Ok(_) => true,
                    Err(qe) => {
                        tracing::error!(path = %path.display(), error = %qe, "quarantine failed");
                        false
                    }
                };
                return PartitionOutcome::Failed {
                    error: e.to_string(),
                    quarantined,
                };
            }
            Err(e) => {
                return PartitionOutcome::Failed {
                    error: e.to_string(),
                    quarantined: false,
                }
            }
        };

        let report = match self.correct(&mut data) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "partition not repairable");
                return PartitionOutcome::Failed {
                    error: e.to_string(),
                    quarantined: false,
                };
            }
        };
        if !report.changed() {
            return PartitionOutcome::Clean(report);
        }

        match PartitionStore::write_to(path, &data) {
            Ok(_) => {
                tracing::info!(
                    path = %path.display(),
                    repaired = report.rows_repaired,
                    flagged = report.rows_flagged,
                    "partition repaired"
                );
                PartitionOutcome::Repaired(report)
            }
            Err(e) => PartitionOutcome::Failed {
                error: RepairError::from(e).to_string(),
                quarantined: false,
            },
        }
    }

    /// Correct every partition under `dir` in parallel. One bad partition
    /// never stops the batch; it is recorded as `Failed`.
    pub fn batch_correct(&self, dir: &Path) -> io::Result<ReportSet> {
        let paths = PartitionStore::list_partitions(dir)?;
        let results: Vec<PartitionResult> = paths
            .par_iter()
            .map(|path| PartitionResult {
                path: path.clone(),
                outcome: self.correct_file(path),
            })
            .collect();

        let set = ReportSet { results };
        let totals = set.totals();
        tracing::info!(
            dir = %dir.display(),
            partitions = set.partitions(),
            repaired = set.repaired(),
            failed = set.failed(),
            rows_repaired = totals.rows_repaired,
            rows_unrepairable = totals.rows_unrepairable,
            "batch correction finished"
        );
        Ok(set)
    }
}
