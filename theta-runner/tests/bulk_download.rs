//! Integration tests for the bulk download engine against an in-memory
//! terminal.
//!
//! Covers the SPX first-week-of-2024 run end to end, skip-on-rerun, per-unit
//! failure isolation and retry budgets, cancellation, and correction of
//! fetched batches before they are persisted.

use chrono::NaiveDate;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use theta_core::calendar::TradingCalendar;
use theta_core::client::TerminalSource;
use theta_core::corrector::{Corrector, CorrectorConfig};
use theta_core::domain::{DataKind, PartitionRows, RowQuality, WorkUnit};
use theta_core::requester::RequestError;
use theta_core::store::{PartitionCheck, PartitionStore};
use theta_core::testing::{sample_rows, StaticSource};

use theta_runner::engine::{BulkDownloadEngine, EngineOptions};
use theta_runner::progress::NoProgress;

// ─── Shared helpers ──────────────────────────────────────────────────

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn spx() -> Vec<String> {
    vec!["SPX".to_string()]
}

/// New Year's Day is the only full close in the first week of 2024.
fn calendar() -> TradingCalendar {
    TradingCalendar::new([d(1)])
}

fn engine(source: Arc<StaticSource>) -> BulkDownloadEngine {
    let source: Arc<dyn TerminalSource> = source;
    BulkDownloadEngine::new(source, calendar()).with_progress(Arc::new(NoProgress))
}

fn underlying(day: u32) -> WorkUnit {
    WorkUnit::underlying("SPX", d(day))
}

fn greeks(day: u32, exp: u32) -> WorkUnit {
    WorkUnit::option("SPX", d(day), d(exp), DataKind::OptionGreeks).unwrap()
}

fn exhausted() -> RequestError {
    RequestError::Exhausted {
        endpoint: "/option/history/greeks/first_order".into(),
        attempts: 3,
        last_error: "status 503".into(),
    }
}

fn fatal() -> RequestError {
    RequestError::Fatal {
        endpoint: "/option/history/greeks/first_order".into(),
        status: Some(400),
        message: "invalid expiration".into(),
    }
}

fn partition_count(dir: &Path) -> usize {
    PartitionStore::list_partitions(dir).unwrap().len()
}

// ─── End to end ──────────────────────────────────────────────────────

#[test]
fn spx_first_week_of_2024() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let engine = engine(source.clone());

    let summary = engine.run(&spx(), d(1), d(5), dir.path(), 2).unwrap();

    // Four trading days × (two expirations × two option kinds + underlying)
    assert_eq!(summary.total, 20);
    assert_eq!(summary.persisted + summary.failed, summary.total);
    assert_eq!(summary.persisted, 20);
    assert_eq!(summary.skipped, 0);
    assert!(summary.is_balanced());
    assert!(summary.all_succeeded());

    let store = PartitionStore::new(dir.path());
    let paths = PartitionStore::list_partitions(dir.path()).unwrap();
    assert_eq!(paths.len(), 20);
    assert!(paths
        .iter()
        .all(|p| !p.to_string_lossy().contains("date=20240101")));
    assert_eq!(store.check(&WorkUnit::underlying("SPX", d(1))), PartitionCheck::Missing);

    // Every unit was fetched exactly once.
    assert_eq!(source.fetch_count(), 20);
    assert_eq!(source.fetches_of(&greeks(2, 12)), 1);
    assert!(store.check(&greeks(5, 5)).is_valid());
    assert!(store.check(&greeks(5, 12)).is_valid());
}

#[test]
fn rerun_skips_valid_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let engine = engine(source.clone());

    engine.run(&spx(), d(2), d(3), dir.path(), 3).unwrap();
    let fetched = source.fetch_count();

    let second = engine.run(&spx(), d(2), d(3), dir.path(), 3).unwrap();
    assert_eq!(second.skipped, second.total);
    assert_eq!(second.persisted, 0);
    assert_eq!(source.fetch_count(), fetched);
}

#[test]
fn invalid_partition_is_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let engine = engine(source.clone());
    engine.run(&spx(), d(2), d(2), dir.path(), 1).unwrap();

    let store = PartitionStore::new(dir.path());
    let path = store.partition_path(&underlying(2));
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let summary = engine.run(&spx(), d(2), d(2), dir.path(), 1).unwrap();
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.skipped, summary.total - 1);
    assert_eq!(source.fetches_of(&underlying(2)), 2);
    assert!(store.check(&underlying(2)).is_valid());
}

#[test]
fn force_downloads_everything_again() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    engine(source.clone())
        .run(&spx(), d(2), d(2), dir.path(), 2)
        .unwrap();

    let summary = engine(source.clone())
        .with_options(EngineOptions {
            force: true,
            ..EngineOptions::default()
        })
        .run(&spx(), d(2), d(2), dir.path(), 2)
        .unwrap();
    assert_eq!(summary.persisted, summary.total);
    assert_eq!(source.fetch_count(), 2 * summary.total);
    assert_eq!(partition_count(dir.path()), summary.total);
}

// ─── Failure isolation ───────────────────────────────────────────────

#[test]
fn fatal_failure_is_isolated_to_its_unit() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let bad = greeks(3, 12);
    source.fail_next(&bad, [fatal()]);

    let summary = engine(source.clone())
        .run(&spx(), d(2), d(5), dir.path(), 4)
        .unwrap();

    assert_eq!(summary.total, 20);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.persisted, 19);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].unit, bad);
    assert_eq!(summary.failures[0].attempts, 1);
    assert!(summary.failures[0].error.contains("invalid expiration"));
    // fatal errors are not retried at the unit level
    assert_eq!(source.fetches_of(&bad), 1);
    assert_eq!(
        PartitionStore::new(dir.path()).check(&bad),
        PartitionCheck::Missing
    );
}

#[test]
fn panicking_unit_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let bad = greeks(2, 12);
    let poisoned = bad.clone();
    let source = Arc::new(StaticSource::new(move |unit: &WorkUnit| {
        if unit == &poisoned {
            panic!("malformed payload for {unit}");
        }
        Ok(sample_rows(unit, 5))
    }));

    let summary = engine(source).run(&spx(), d(2), d(2), dir.path(), 2).unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.persisted, 4);
    assert_eq!(summary.failed, 1);
    assert!(summary.is_balanced());
    assert_eq!(summary.failures[0].unit, bad);
    assert!(summary.failures[0].error.contains("malformed payload"));
    assert_eq!(
        PartitionStore::new(dir.path()).check(&bad),
        PartitionCheck::Missing
    );
}

#[test]
fn transient_failure_retried_within_unit_budget() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let flaky = greeks(2, 2);
    source.fail_next(&flaky, [exhausted()]);

    let summary = engine(source.clone())
        .run(&spx(), d(2), d(2), dir.path(), 2)
        .unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.persisted, 5);
    assert_eq!(source.fetches_of(&flaky), 2);
}

#[test]
fn unit_budget_exhaustion_records_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::synthetic(5));
    let flaky = greeks(2, 2);
    source.fail_next(&flaky, [exhausted(), exhausted(), exhausted()]);

    let summary = engine(source.clone())
        .with_options(EngineOptions {
            max_unit_attempts: 3,
            ..EngineOptions::default()
        })
        .run(&spx(), d(2), d(2), dir.path(), 2)
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].attempts, 3);
    assert_eq!(source.fetches_of(&flaky), 3);
    assert!(summary.is_balanced());
}

#[test]
fn empty_response_is_a_failure_not_a_partition() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::new(|unit: &WorkUnit| {
        if unit.kind() == DataKind::UnderlyingOhlc {
            Ok(PartitionRows::empty(unit.kind()))
        } else {
            Ok(sample_rows(unit, 3))
        }
    }));

    let summary = engine(source).run(&spx(), d(2), d(3), dir.path(), 2).unwrap();
    assert_eq!(summary.failed, 2);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.unit.kind() == DataKind::UnderlyingOhlc && f.attempts == 1));
    assert_eq!(partition_count(dir.path()), summary.persisted);
}

// ─── Cancellation and crash leftovers ────────────────────────────────

#[test]
fn cancellation_stops_pulling_new_units() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let source = Arc::new(StaticSource::new(move |unit: &WorkUnit| {
        // Ctrl-C arrives while the first unit is in flight.
        flag.store(true, Ordering::Relaxed);
        Ok(sample_rows(unit, 3))
    }));

    let summary = engine(source.clone())
        .with_cancel_flag(cancel)
        .run(&spx(), d(2), d(5), dir.path(), 1)
        .unwrap();

    // The in-flight unit completes; nothing else starts.
    assert_eq!(summary.persisted, 1);
    assert_eq!(summary.cancelled, summary.total - 1);
    assert!(summary.is_balanced());
    assert!(!summary.all_succeeded());
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(partition_count(dir.path()), 1);
}

#[test]
fn stale_temp_files_swept_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path());
    let leftover = store
        .partition_path(&underlying(2))
        .with_extension("parquet.tmp");
    std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
    std::fs::write(&leftover, b"partial").unwrap();

    let source = Arc::new(StaticSource::synthetic(3));
    let summary = engine(source).run(&spx(), d(2), d(2), dir.path(), 2).unwrap();
    assert_eq!(summary.persisted, 5);
    assert!(!leftover.exists());
    assert!(store.check(&underlying(2)).is_valid());
}

// ─── Correction before persist ───────────────────────────────────────

#[test]
fn fetched_batches_corrected_before_persist() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(StaticSource::new(|unit: &WorkUnit| {
        let mut rows = sample_rows(unit, 5);
        if let PartitionRows::Underlying(r) = &mut rows {
            r[2].open = 0.0;
            r[2].high = 0.0;
            r[2].low = 0.0;
            r[2].close = 0.0;
        }
        Ok(rows)
    }));
    // No terminal attached, so repairs come from interpolation.
    let corrector = Corrector::new(CorrectorConfig::default());

    let summary = engine(source)
        .with_corrector(corrector)
        .run(&spx(), d(2), d(2), dir.path(), 1)
        .unwrap();
    assert_eq!(summary.persisted, 5);

    let stored = PartitionStore::new(dir.path()).read(&underlying(2)).unwrap();
    match &stored.rows {
        PartitionRows::Underlying(rows) => {
            assert_eq!(rows.len(), 5);
            assert_eq!(rows[2].quality, RowQuality::Interpolated);
            assert!(rows[2].close > 0.0);
            assert_eq!(rows[1].quality, RowQuality::Original);
        }
        other => panic!("expected underlying rows, got {:?}", other.kind()),
    }
}
