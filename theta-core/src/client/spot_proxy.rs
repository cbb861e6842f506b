//! Reconstruct underlying OHLC from option greeks.
//!
//! Used when the terminal has no direct OHLC for a root. Spot at each sample
//! is the terminal's `underlying_price` when it reports one, otherwise the
//! put-call parity estimate `K + C_mid - P_mid` from an at-the-money pair.

use crate::domain::{is_missing_price, GreeksRow, OhlcRow, RowQuality};
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

/// One reconstructed spot observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotSample {
    pub timestamp: NaiveDateTime,
    pub price: f64,
}

/// The median listed strike. Listed strikes are roughly centred on spot, so
/// this is the at-the-money pick without needing a spot estimate.
pub fn atm_strike(strikes: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = strikes.iter().copied().filter(|s| s.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[sorted.len() / 2])
}

/// Join call and put rows of one strike by timestamp and estimate spot.
///
/// Timestamps with neither a reported underlying price nor a full parity
/// pair are dropped.
pub fn spot_samples(calls: &[GreeksRow], puts: &[GreeksRow], strike: f64) -> Vec<SpotSample> {
    let mut by_ts: BTreeMap<NaiveDateTime, (Option<&GreeksRow>, Option<&GreeksRow>)> =
        BTreeMap::new();
    for row in calls {
        by_ts.entry(row.timestamp).or_default().0 = Some(row);
    }
    for row in puts {
        by_ts.entry(row.timestamp).or_default().1 = Some(row);
    }

    by_ts
        .into_iter()
        .filter_map(|(timestamp, (call, put))| {
            let reported = [call, put]
                .into_iter()
                .flatten()
                .map(|r| r.underlying_price)
                .find(|p| !is_missing_price(*p));
            let parity = || match (call.and_then(GreeksRow::mid), put.and_then(GreeksRow::mid)) {
                (Some(c), Some(p)) => Some(strike + c - p).filter(|s| !is_missing_price(*s)),
                _ => None,
            };
            reported
                .or_else(parity)
                .map(|price| SpotSample { timestamp, price })
        })
        .collect()
}

fn bucket_start(ts: NaiveDateTime, interval: Duration) -> NaiveDateTime {
    let width = interval.num_milliseconds().max(1);
    let ms = ts.and_utc().timestamp_millis();
    let floored = ms - ms.rem_euclid(width);
    ts - Duration::milliseconds(ms - floored)
}

/// Aggregate samples into `interval` bars: open=first, high=max, low=min,
/// close=last, volume=number of samples.
pub fn aggregate_ohlc(samples: &[SpotSample], interval: Duration) -> Vec<OhlcRow> {
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|s| s.timestamp);

    let mut bars: BTreeMap<NaiveDateTime, OhlcRow> = BTreeMap::new();
    for s in &sorted {
        let start = bucket_start(s.timestamp, interval);
        bars.entry(start)
            .and_modify(|bar| {
                bar.high = bar.high.max(s.price);
                bar.low = bar.low.min(s.price);
                bar.close = s.price;
                bar.volume = bar.volume.map(|v| v + 1);
            })
            .or_insert_with(|| OhlcRow {
                timestamp: start,
                open: s.price,
                high: s.price,
                low: s.price,
                close: s.price,
                volume: Some(1),
                quality: RowQuality::Original,
            });
    }
    bars.into_values().collect()
}
