//! Theta Runner: bulk download orchestration and the download/correct
//! pipeline.
//!
//! This crate builds on `theta-core` to provide:
//! - Work-unit expansion over symbols, trading days and target expirations
//! - A fixed worker pool with per-unit retry, skip checks and cancellation
//! - The pipeline composing terminal client, engine and corrector
//! - TOML run configuration
//! - CSV/JSON exports of run summaries and correction passes

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod progress;
pub mod report;

pub use config::{ConfigError, RunConfig};
pub use engine::{
    BulkDownloadEngine, EngineError, EngineOptions, RunSummary, UnitError, UnitFailure,
    UnitReport, UnitState,
};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
pub use progress::{NoProgress, RunProgress, StdoutProgress, TracingProgress};
pub use report::{export_corrections_csv, export_failures_csv, save_run_report};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn engine_is_send_sync() {
        assert_send::<BulkDownloadEngine>();
        assert_sync::<BulkDownloadEngine>();
    }

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
    }

    #[test]
    fn summary_types_are_send_sync() {
        assert_send::<RunSummary>();
        assert_sync::<RunSummary>();
        assert_send::<UnitReport>();
        assert_sync::<UnitReport>();
        assert_send::<PipelineReport>();
        assert_sync::<PipelineReport>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<RunConfig>();
        assert_sync::<RunConfig>();
        assert_send::<EngineOptions>();
        assert_sync::<EngineOptions>();
    }
}
