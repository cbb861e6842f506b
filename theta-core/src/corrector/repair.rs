//! Repair passes over one series-ordered row vector.
//!
//! Rows must already be sorted by `(series_key, timestamp)`. Every pass
//! works series by series and never moves a row across series.

use super::RepairReport;
use crate::domain::{series_ranges, RowQuality, SeriesRow};
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

/// Rows the interpolator may lean on: valid prices that did not themselves
/// come from interpolation. A self-filled row still carries its own
/// observed price.
fn is_anchor<T: SeriesRow>(row: &T) -> bool {
    !row.is_degenerate()
        && matches!(
            row.quality(),
            RowQuality::Original | RowQuality::Refetched | RowQuality::Filled
        )
}

/// Degenerate rows still waiting for a repair decision.
fn needs_repair<T: SeriesRow>(row: &T) -> bool {
    row.is_degenerate() && row.quality() != RowQuality::Unrepairable
}

/// Fill partially missing rows from their own reference price.
pub fn repair_partial<T: SeriesRow>(rows: &mut [T], report: &mut RepairReport) {
    for row in rows.iter_mut() {
        if row.is_degenerate() || !row.is_partial() {
            continue;
        }
        if row.fill_partial() {
            row.set_quality(RowQuality::Filled);
            report.rows_repaired += 1;
        }
    }
}

/// Replace degenerate rows with same-timestamp rows returned by `refetch`.
///
/// `refetch` is called at most once per series that has something to
/// repair, with a representative row of that series. Returning `None` means
/// the terminal could not help.
pub fn repair_by_refetch<T, F>(rows: &mut [T], mut refetch: F, report: &mut RepairReport)
where
    T: SeriesRow,
    F: FnMut(&T) -> Option<Vec<T>>,
{
    for range in series_ranges(rows) {
        let series = &mut rows[range];
        if !series.iter().any(needs_repair) {
            continue;
        }
        let Some(fresh) = refetch(&series[0]) else {
            continue;
        };
        let key = series[0].series_key();
        let by_ts: BTreeMap<NaiveDateTime, T> = fresh
            .into_iter()
            .filter(|r| r.series_key() == key && !r.is_degenerate())
            .map(|r| (r.timestamp(), r))
            .collect();

        for row in series.iter_mut().filter(|r| needs_repair(&**r)) {
            if let Some(replacement) = by_ts.get(&row.timestamp()) {
                let mut replacement = replacement.clone();
                replacement.set_quality(RowQuality::Refetched);
                *row = replacement;
                report.rows_repaired += 1;
            }
        }
    }
}

/// Interpolate each remaining degenerate row from the nearest anchors on
/// both sides, no further than `window` rows away. Rows without both
/// anchors are flagged unrepairable.
pub fn repair_by_interpolation<T: SeriesRow>(
    rows: &mut [T],
    window: usize,
    report: &mut RepairReport,
) {
    for range in series_ranges(rows) {
        let series = &mut rows[range];
        let targets: Vec<usize> = (0..series.len())
            .filter(|&i| needs_repair(&series[i]))
            .collect();

        for i in targets {
            let lo = i.saturating_sub(window);
            let hi = (i + window).min(series.len() - 1);
            let before = (lo..i).rev().find(|&j| is_anchor(&series[j]));
            let after = (i + 1..=hi).find(|&j| is_anchor(&series[j]));

            match (before, after) {
                (Some(b), Some(a)) => {
                    let ts = series[i].timestamp();
                    series[i] = T::interpolate(&series[b], &series[a], ts);
                    report.rows_repaired += 1;
                }
                _ => {
                    series[i].set_quality(RowQuality::Unrepairable);
                    report.rows_flagged += 1;
                }
            }
        }
    }
}

/// Count rows still degenerate after repair.
pub fn count_unrepairable<T: SeriesRow>(rows: &[T]) -> usize {
    rows.iter().filter(|r| r.is_degenerate()).count()
}

/// Number of whole intervals missing strictly between `a` and `b`.
fn missing_between(a: NaiveDateTime, b: NaiveDateTime, interval: Duration) -> i64 {
    let step = interval.num_milliseconds();
    let span = (b - a).num_milliseconds();
    if step <= 0 || span <= step {
        return 0;
    }
    (span - 1) / step
}

/// Insert interpolated rows into short gaps; flag longer ones.
///
/// A gap is fillable when both bounding rows have valid prices and at most
/// `max_missing` intervals are absent.
pub fn fill_gaps<T: SeriesRow>(
    rows: &mut Vec<T>,
    interval: Duration,
    max_missing: usize,
    report: &mut RepairReport,
) {
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for range in series_ranges(rows) {
        let series = &rows[range];
        for (i, row) in series.iter().enumerate() {
            if let Some(prev) = i.checked_sub(1).map(|p| &series[p]) {
                let missing = missing_between(prev.timestamp(), row.timestamp(), interval);
                if missing > 0 {
                    let fillable = missing as usize <= max_missing
                        && !prev.is_degenerate()
                        && !row.is_degenerate();
                    if fillable {
                        for k in 1..=missing {
                            let ts = prev.timestamp() + interval * k as i32;
                            out.push(T::interpolate(prev, row, ts));
                        }
                        report.rows_inserted += missing as usize;
                        report.rows_repaired += missing as usize;
                    } else {
                        report.gaps_flagged += 1;
                        report.rows_unrepairable += missing as usize;
                    }
                }
            }
            out.push(row.clone());
        }
    }
    *rows = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{check_ordering, Contract, OhlcRow, OptionOhlcRow, Right};
    use chrono::NaiveDate;

    fn ts(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
            + Duration::minutes(m as i64)
    }

    fn bar(m: u32, p: f64) -> OhlcRow {
        OhlcRow::new(ts(m), p, p + 1.0, p - 1.0, p)
    }

    fn zero(m: u32) -> OhlcRow {
        OhlcRow::new(ts(m), 0.0, 0.0, 0.0, 0.0)
    }

    // ── Interpolation ──

    #[test]
    fn interior_zero_row_is_interpolated() {
        let mut rows = vec![bar(0, 100.0), zero(1), bar(2, 102.0)];
        let mut report = RepairReport::default();
        repair_by_interpolation(&mut rows, 5, &mut report);
        assert_eq!(report.rows_repaired, 1);
        assert_eq!(rows[1].close, 101.0);
        assert_eq!(rows[1].quality, RowQuality::Interpolated);
    }

    #[test]
    fn edge_zero_row_is_flagged() {
        let mut rows = vec![zero(0), bar(1, 100.0), bar(2, 101.0)];
        let mut report = RepairReport::default();
        repair_by_interpolation(&mut rows, 5, &mut report);
        assert_eq!(report.rows_repaired, 0);
        assert_eq!(report.rows_flagged, 1);
        assert_eq!(rows[0].quality, RowQuality::Unrepairable);
    }

    #[test]
    fn anchors_beyond_window_are_ignored() {
        let mut rows = vec![bar(0, 100.0), zero(1), zero(2), zero(3), bar(4, 104.0)];
        let mut report = RepairReport::default();
        repair_by_interpolation(&mut rows, 1, &mut report);
        assert_eq!(report.rows_flagged, 3);
    }

    #[test]
    fn flagged_rows_are_not_revisited() {
        let mut rows = vec![zero(0), bar(1, 100.0)];
        let mut first = RepairReport::default();
        repair_by_interpolation(&mut rows, 5, &mut first);
        let mut second = RepairReport::default();
        repair_by_interpolation(&mut rows, 5, &mut second);
        assert_eq!(first.rows_flagged, 1);
        assert_eq!(second, RepairReport::default());
    }

    #[test]
    fn interpolation_stays_within_series() {
        let call = Contract::new(100.0, Right::Call);
        let put = Contract::new(100.0, Right::Put);
        let mut rows = vec![
            OptionOhlcRow { contract: call, bar: bar(0, 5.0) },
            OptionOhlcRow { contract: call, bar: zero(1) },
            OptionOhlcRow { contract: put, bar: bar(0, 7.0) },
        ];
        let mut report = RepairReport::default();
        repair_by_interpolation(&mut rows, 5, &mut report);
        assert_eq!(report.rows_flagged, 1);
        assert_eq!(rows[1].bar.quality, RowQuality::Unrepairable);
    }

    // ── Re-fetch ──

    #[test]
    fn refetch_replaces_matching_timestamp() {
        let mut rows = vec![bar(0, 100.0), zero(1), bar(2, 102.0)];
        let mut report = RepairReport::default();
        let mut calls = 0;
        repair_by_refetch(
            &mut rows,
            |_| {
                calls += 1;
                Some(vec![bar(1, 150.0)])
            },
            &mut report,
        );
        assert_eq!(calls, 1);
        assert_eq!(report.rows_repaired, 1);
        assert_eq!(rows[1].close, 150.0);
        assert_eq!(rows[1].quality, RowQuality::Refetched);
    }

    #[test]
    fn refetch_skipped_for_clean_series() {
        let mut rows = vec![bar(0, 100.0), bar(1, 101.0)];
        let mut report = RepairReport::default();
        repair_by_refetch(&mut rows, |_| panic!("no refetch expected"), &mut report);
        assert_eq!(report, RepairReport::default());
    }

    #[test]
    fn degenerate_refetch_does_not_count() {
        let mut rows = vec![bar(0, 100.0), zero(1)];
        let mut report = RepairReport::default();
        repair_by_refetch(&mut rows, |_| Some(vec![zero(1)]), &mut report);
        assert_eq!(report.rows_repaired, 0);
    }

    // ── Partial rows ──

    #[test]
    fn partial_row_filled_from_close() {
        let mut row = bar(0, 100.0);
        row.open = 0.0;
        let mut rows = vec![row];
        let mut report = RepairReport::default();
        repair_partial(&mut rows, &mut report);
        assert_eq!(report.rows_repaired, 1);
        assert_eq!(rows[0].open, 100.0);
        assert_eq!(rows[0].quality, RowQuality::Filled);
        assert!(rows[0].is_sane());
    }

    #[test]
    fn filled_row_anchors_interpolation() {
        let mut partial = bar(0, 100.0);
        partial.high = 0.0;
        partial.low = 0.0;
        let mut rows = vec![partial, zero(1), bar(2, 102.0)];
        let mut report = RepairReport::default();
        repair_partial(&mut rows, &mut report);
        repair_by_interpolation(&mut rows, 5, &mut report);
        assert_eq!(report.rows_repaired, 2);
        assert_eq!(report.rows_flagged, 0);
        assert_eq!(rows[1].close, 101.0);
        assert_eq!(rows[1].quality, RowQuality::Interpolated);

        let mut again = RepairReport::default();
        repair_partial(&mut rows, &mut again);
        repair_by_interpolation(&mut rows, 5, &mut again);
        assert_eq!(again, RepairReport::default());
    }

    // ── Gaps ──

    #[test]
    fn short_gap_gets_interpolated_rows() {
        let mut rows = vec![bar(0, 100.0), bar(2, 102.0)];
        let mut report = RepairReport::default();
        fill_gaps(&mut rows, Duration::minutes(1), 3, &mut report);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].timestamp, ts(1));
        assert_eq!(rows[1].close, 101.0);
        assert_eq!(report.rows_inserted, 1);
        check_ordering(&rows).unwrap();
    }

    #[test]
    fn long_gap_is_flagged_not_filled() {
        let mut rows = vec![bar(0, 100.0), bar(10, 110.0)];
        let mut report = RepairReport::default();
        fill_gaps(&mut rows, Duration::minutes(1), 3, &mut report);
        assert_eq!(rows.len(), 2);
        assert_eq!(report.gaps_flagged, 1);
        assert_eq!(report.rows_unrepairable, 9);
        assert_eq!(report.rows_repaired, 0);
    }

    #[test]
    fn off_grid_spacing_counts_whole_intervals() {
        assert_eq!(missing_between(ts(0), ts(1), Duration::minutes(1)), 0);
        assert_eq!(missing_between(ts(0), ts(3), Duration::minutes(1)), 2);
        let half = ts(2) + Duration::seconds(30);
        assert_eq!(missing_between(ts(0), half, Duration::minutes(1)), 2);
    }
}
