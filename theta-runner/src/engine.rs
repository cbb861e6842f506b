//! Bulk download engine.
//!
//! Expands (symbols × trading days × target expirations × kinds) into work
//! units, then drains them with a fixed pool of workers. Each unit moves
//! `Pending → InFlight → {Persisted | Failed | Skipped}`; a failure in one unit
//! never affects another.

use chrono::NaiveDate;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use theta_core::calendar::{select_target_expirations, trading_days, CalendarError, TradingCalendar};
use theta_core::client::TerminalSource;
use theta_core::corrector::{Corrector, RepairError};
use theta_core::domain::{DataKind, PartitionData, WorkUnit};
use theta_core::requester::RequestError;
use theta_core::store::{PartitionCheck, PartitionStore, PersistError};
use thiserror::Error;

use crate::progress::{RunProgress, TracingProgress};

/// Run-level failures. Anything unit-scoped is recorded in the summary instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("worker_count must be at least 1")]
    NoWorkers,

    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("no symbols to download")]
    NoSymbols,

    #[error("cannot build work queue: {0}")]
    Calendar(#[from] CalendarError),

    #[error("output directory {path}: {source}")]
    Output {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Why a single attempt at a unit failed.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("terminal returned no rows")]
    Empty,

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Repair(#[from] RepairError),
}

impl UnitError {
    /// Worth another attempt within the unit budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            UnitError::Request(e) => e.is_transient(),
            UnitError::Persist(PersistError::WriteFailed { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InFlight,
    Persisted { rows: usize },
    Failed { error: String },
    Skipped,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Persisted { .. } | UnitState::Failed { .. } | UnitState::Skipped
        )
    }
}

/// Final state of one unit, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub state: UnitState,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: WorkUnit,
    pub error: String,
    pub attempts: u32,
}

/// Aggregate outcome of a run. Partial completion is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub persisted: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Units never started because the run was cancelled.
    pub cancelled: usize,
    pub rows_written: usize,
    pub failures: Vec<UnitFailure>,
}

impl RunSummary {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, report: UnitReport) {
        match report.state {
            UnitState::Persisted { rows } => {
                self.persisted += 1;
                self.rows_written += rows;
            }
            UnitState::Skipped => self.skipped += 1,
            UnitState::Failed { error } => {
                self.failed += 1;
                self.failures.push(UnitFailure {
                    unit: report.unit,
                    error,
                    attempts: report.attempts,
                });
            }
            // Workers only report terminal states.
            UnitState::Pending | UnitState::InFlight => {}
        }
    }

    /// Every unit is accounted for exactly once.
    pub fn is_balanced(&self) -> bool {
        self.persisted + self.failed + self.skipped + self.cancelled == self.total
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Attempts per unit; only transient failures are retried.
    pub max_unit_attempts: u32,
    pub force: bool,
    pub intersect_listed: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_unit_attempts: 2,
            force: false,
            intersect_listed: true,
        }
    }
}

type Queue = Mutex<VecDeque<(usize, WorkUnit)>>;

pub struct BulkDownloadEngine {
    source: Arc<dyn TerminalSource>,
    calendar: TradingCalendar,
    options: EngineOptions,
    corrector: Option<Corrector>,
    cancel: Arc<AtomicBool>,
    progress: Arc<dyn RunProgress>,
}

impl BulkDownloadEngine {
    pub fn new(source: Arc<dyn TerminalSource>, calendar: TradingCalendar) -> Self {
        Self {
            source,
            calendar,
            options: EngineOptions::default(),
            corrector: None,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Correct each fetched batch before persisting it.
    pub fn with_corrector(mut self, corrector: Corrector) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Share a cancellation flag, e.g. one set from a Ctrl-C handler.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Work units for `symbols` over `[start, end]`, in queue order.
    pub fn expand(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<WorkUnit>, EngineError> {
        let days = trading_days(start, end, &self.calendar);
        let mut units = Vec::new();
        for symbol in symbols {
            for &day in &days {
                for exp in self.expirations_for(symbol, day)? {
                    for kind in [DataKind::OptionOhlc, DataKind::OptionGreeks] {
                        units.extend(WorkUnit::option(symbol.as_str(), day, exp, kind));
                    }
                }
                units.push(WorkUnit::underlying(symbol.as_str(), day));
            }
        }
        Ok(units)
    }

    fn expirations_for(
        &self,
        symbol: &str,
        day: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, EngineError> {
        let targets = select_target_expirations(symbol, day, &self.calendar)?;
        if !self.options.intersect_listed {
            return Ok(targets);
        }
        match self.source.list_expirations(symbol, day) {
            Ok(listed) => {
                let listed: BTreeSet<NaiveDate> = listed.into_iter().collect();
                let kept: BTreeSet<NaiveDate> = targets.intersection(&listed).copied().collect();
                if kept.len() < targets.len() {
                    tracing::debug!(
                        symbol,
                        date = %day,
                        wanted = targets.len(),
                        listed = kept.len(),
                        "target expirations not all listed"
                    );
                }
                Ok(kept)
            }
            Err(e) => {
                tracing::warn!(
                    symbol,
                    date = %day,
                    error = %e,
                    "expiration listing unavailable, using calendar targets"
                );
                Ok(targets)
            }
        }
    }

    /// Download every unit for `symbols` over `[start, end]` into `output_path`.
    pub fn run(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        output_path: &Path,
        worker_count: usize,
    ) -> Result<RunSummary, EngineError> {
        if worker_count == 0 {
            return Err(EngineError::NoWorkers);
        }
        if symbols.is_empty() {
            return Err(EngineError::NoSymbols);
        }
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }

        let output_err = |source| EngineError::Output {
            path: output_path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(output_path).map_err(output_err)?;
        let store = PartitionStore::new(output_path);
        let swept = store.sweep_temp_files().map_err(output_err)?;
        if swept > 0 {
            tracing::info!(swept, "removed stale temp files");
        }

        let units = self.expand(symbols, start, end)?;
        let total = units.len();
        self.progress.on_expanded(total);
        tracing::info!(
            source = self.source.name(),
            symbols = symbols.len(),
            %start,
            %end,
            units = total,
            workers = worker_count,
            "starting bulk run"
        );

        let queue: Queue = Mutex::new(units.into_iter().enumerate().collect());
        let (tx, rx) = mpsc::channel::<UnitReport>();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("theta-worker-{i}"))
            .build()
            .map_err(|e| EngineError::Pool(e.to_string()))?;

        pool.scope(|s| {
            for _ in 0..worker_count {
                let tx = tx.clone();
                let queue = &queue;
                let store = &store;
                s.spawn(move |_| self.worker_loop(queue, store, total, tx));
            }
        });
        drop(tx);

        let mut summary = RunSummary::new(total);
        for report in rx {
            summary.record(report);
        }
        summary.cancelled = queue.into_inner().map(|q| q.len()).unwrap_or(0);
        summary.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        if summary.cancelled > 0 {
            tracing::warn!(cancelled = summary.cancelled, "run cancelled before queue drained");
        }

        self.progress.on_run_complete(&summary);
        Ok(summary)
    }

    fn worker_loop(
        &self,
        queue: &Queue,
        store: &PartitionStore,
        total: usize,
        tx: mpsc::Sender<UnitReport>,
    ) {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => {
                    tracing::error!("work queue poisoned, worker stopping");
                    break;
                }
            };
            let Some((index, unit)) = next else {
                break;
            };

            self.progress.on_start(&unit, index, total);
            let report = self.process_unit_isolated(store, unit);
            self.progress.on_complete(&report, index, total);
            if tx.send(report).is_err() {
                break;
            }
        }
    }

    /// `process_unit`, with a panic recorded as that unit's failure.
    fn process_unit_isolated(&self, store: &PartitionStore, unit: WorkUnit) -> UnitReport {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process_unit(store, unit.clone())
        }));
        attempt.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(unit = %unit, panic = %message, "unit processing panicked");
            UnitReport {
                unit,
                state: UnitState::Failed {
                    error: format!("panicked: {message}"),
                },
                attempts: 1,
            }
        })
    }

    fn process_unit(&self, store: &PartitionStore, unit: WorkUnit) -> UnitReport {
        if !self.options.force {
            match store.check(&unit) {
                PartitionCheck::Valid(_) => {
                    return UnitReport {
                        unit,
                        state: UnitState::Skipped,
                        attempts: 0,
                    }
                }
                PartitionCheck::Invalid(reason) => {
                    tracing::warn!(unit = %unit, reason = %reason, "existing partition invalid, re-downloading");
                }
                PartitionCheck::Missing => {}
            }
        }

        let max_attempts = self.options.max_unit_attempts.max(1);
        let mut attempts = 0;
        let state = loop {
            attempts += 1;
            match self.fetch_and_persist(store, &unit) {
                Ok(rows) => break UnitState::Persisted { rows },
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    tracing::warn!(unit = %unit, attempt = attempts, error = %e, "unit attempt failed, retrying");
                }
                Err(e) => {
                    break UnitState::Failed {
                        error: e.to_string(),
                    }
                }
            }
        };
        UnitReport {
            unit,
            state,
            attempts,
        }
    }

    fn fetch_and_persist(&self, store: &PartitionStore, unit: &WorkUnit) -> Result<usize, UnitError> {
        let rows = self.source.fetch_unit(unit)?;
        if rows.is_empty() {
            return Err(UnitError::Empty);
        }
        let mut data = PartitionData::new(unit.clone(), rows);
        data.canonicalize();
        if let Some(corrector) = &self.corrector {
            let report = corrector.correct(&mut data)?;
            if report.changed() {
                tracing::debug!(
                    unit = %unit,
                    repaired = report.rows_repaired,
                    flagged = report.rows_flagged,
                    "corrected before persist"
                );
            }
        }
        store.write(&data)?;
        Ok(data.len())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
