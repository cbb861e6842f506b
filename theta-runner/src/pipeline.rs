//! Download-then-correct pipeline over one as-of date or a date range.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use theta_core::calendar::{years_in_range, TradingCalendar};
use theta_core::client::{TerminalSource, ThetaClient};
use theta_core::corrector::{Corrector, ReportSet};
use theta_core::requester::{
    AuditLog, EndpointStats, ReqwestTransport, RequestError, RequestStats, ResilientRequester,
    TransportError,
};
use thiserror::Error;

use crate::config::RunConfig;
use crate::engine::{BulkDownloadEngine, EngineError, RunSummary};
use crate::progress::{RunProgress, TracingProgress};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open audit log {path}: {source}")]
    AuditLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to load trading calendar: {0}")]
    Calendar(#[source] RequestError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("correction pass over {path}: {source}")]
    Correct {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Everything a pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub summary: RunSummary,
    pub corrections: ReportSet,
    /// Per-endpoint request statistics; empty when the source is not a
    /// live terminal.
    pub request_stats: BTreeMap<String, EndpointStats>,
}

impl PipelineReport {
    pub fn all_succeeded(&self) -> bool {
        self.summary.all_succeeded() && self.corrections.failed() == 0
    }
}

/// Terminal client, bulk engine and corrector wired from one `RunConfig`.
pub struct Pipeline {
    config: RunConfig,
    source: Arc<dyn TerminalSource>,
    stats: Option<Arc<RequestStats>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<dyn RunProgress>,
}

impl Pipeline {
    /// Connect to the terminal described by `config`.
    pub fn connect(config: RunConfig) -> Result<Self, PipelineError> {
        let audit_path = config.terminal.audit_log.clone();
        if let Some(parent) = audit_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::AuditLog {
                path: audit_path.clone(),
                source,
            })?;
        }
        let audit = AuditLog::open(&audit_path).map_err(|source| PipelineError::AuditLog {
            path: audit_path.clone(),
            source,
        })?;

        let transport = Arc::new(ReqwestTransport::new(config.timeout())?);
        let stats = Arc::new(RequestStats::new());
        let requester = ResilientRequester::new(
            transport,
            &config.terminal.base_url,
            config.retry_policy(),
            Arc::new(audit),
            stats.clone(),
        );
        let client = ThetaClient::new(requester)
            .with_interval(config.terminal.interval.as_str())
            .with_spot_sample_interval(config.terminal.spot_sample_interval.as_str());

        tracing::info!(
            base_url = %config.terminal.base_url,
            audit_log = %audit_path.display(),
            "connected pipeline to terminal"
        );
        let mut pipeline = Self::with_source(config, Arc::new(client));
        pipeline.stats = Some(stats);
        Ok(pipeline)
    }

    /// Run against any terminal source.
    pub fn with_source(config: RunConfig, source: Arc<dyn TerminalSource>) -> Self {
        Self {
            config,
            source,
            stats: None,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn TerminalSource> {
        &self.source
    }

    pub fn stats(&self) -> Option<&Arc<RequestStats>> {
        self.stats.as_ref()
    }

    /// Full-close calendar covering `[start, end]`.
    pub fn load_calendar(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<TradingCalendar, PipelineError> {
        let calendar = self
            .source
            .load_calendar(&years_in_range(start, end))
            .map_err(PipelineError::Calendar)?;
        tracing::debug!(holidays = calendar.len(), "calendar loaded");
        Ok(calendar)
    }

    pub fn corrector(&self) -> Corrector {
        Corrector::new(self.config.corrector_config()).with_source(self.source.clone())
    }

    /// Download and correct the configured symbols for one date.
    pub fn run(&self, as_of: NaiveDate) -> Result<PipelineReport, PipelineError> {
        self.run_range(as_of, as_of)
    }

    /// Download the configured symbols over `[start, end]` without the
    /// batch correction pass. Freshly fetched partitions are still corrected
    /// before persisting when `bulk.correct_on_fetch` is set.
    pub fn download(&self, start: NaiveDate, end: NaiveDate) -> Result<RunSummary, PipelineError> {
        let calendar = self.load_calendar(start, end)?;
        let mut engine = BulkDownloadEngine::new(self.source.clone(), calendar)
            .with_options(self.config.engine_options())
            .with_cancel_flag(self.cancel.clone())
            .with_progress(self.progress.clone());
        if self.config.bulk.correct_on_fetch {
            engine = engine.with_corrector(self.corrector());
        }

        Ok(engine.run(
            &self.config.symbols,
            start,
            end,
            &self.config.output_dir,
            self.config.bulk.workers,
        )?)
    }

    /// Download and correct the configured symbols over `[start, end]`.
    ///
    /// A cancelled download skips the correction pass.
    pub fn run_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PipelineReport, PipelineError> {
        let summary = self.download(start, end)?;

        let corrections = if self.cancel.load(Ordering::Relaxed) {
            tracing::warn!(
                cancelled = summary.cancelled,
                "run cancelled, skipping correction pass"
            );
            ReportSet::default()
        } else {
            self.correct_symbols()?
        };

        let request_stats = match &self.stats {
            Some(stats) => {
                stats.log_summary();
                if let Some(path) = &self.config.terminal.stats_csv {
                    if let Err(e) = stats.write_csv(path) {
                        tracing::error!(path = %path.display(), error = %e, "failed to write request stats");
                    }
                }
                stats.snapshot()
            }
            None => BTreeMap::new(),
        };

        Ok(PipelineReport {
            summary,
            corrections,
            request_stats,
        })
    }

    /// Batch-correct every configured symbol directory that exists.
    ///
    /// This is a full sweep: partitions from earlier runs are checked too,
    /// and ones already clean come back unchanged.
    pub fn correct_symbols(&self) -> Result<ReportSet, PipelineError> {
        let corrector = self.corrector();
        let mut corrections = ReportSet::default();
        for symbol in &self.config.symbols {
            let dir = self.config.output_dir.join(format!("symbol={symbol}"));
            if !dir.is_dir() {
                tracing::debug!(symbol, "nothing persisted, skipping correction");
                continue;
            }
            let set = corrector
                .batch_correct(&dir)
                .map_err(|source| PipelineError::Correct {
                    path: dir.clone(),
                    source,
                })?;
            corrections.merge(set);
        }
        Ok(corrections)
    }
}
