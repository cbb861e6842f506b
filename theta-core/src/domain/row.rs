//! Row types stored in partitions, and the `SeriesRow` abstraction the
//! corrector works over.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance of a row. Persisted as a column so repairs stay auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowQuality {
    #[default]
    Original,
    Refetched,
    /// Partially missing prices completed from the row's own reference price.
    Filled,
    Interpolated,
    Unrepairable,
}

impl RowQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            RowQuality::Original => "original",
            RowQuality::Refetched => "refetched",
            RowQuality::Filled => "filled",
            RowQuality::Interpolated => "interpolated",
            RowQuality::Unrepairable => "unrepairable",
        }
    }
}

impl FromStr for RowQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(RowQuality::Original),
            "refetched" => Ok(RowQuality::Refetched),
            "filled" => Ok(RowQuality::Filled),
            "interpolated" => Ok(RowQuality::Interpolated),
            "unrepairable" => Ok(RowQuality::Unrepairable),
            other => Err(format!("unknown row quality '{other}'")),
        }
    }
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Right {
    #[serde(rename = "C")]
    Call,
    #[serde(rename = "P")]
    Put,
}

impl Right {
    pub fn as_str(self) -> &'static str {
        match self {
            Right::Call => "C",
            Right::Put => "P",
        }
    }

    /// Parse the spellings the terminal uses (`C`, `call`, `CALL`, ...).
    pub fn parse_terminal(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(Right::Call),
            "P" | "PUT" => Some(Right::Put),
            _ => None,
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single listed contract within one expiration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub strike: f64,
    pub right: Right,
}

/// Totally ordered identity of a contract (strike in thousandths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractKey {
    pub strike_millis: i64,
    pub right: Right,
}

impl Contract {
    pub fn new(strike: f64, right: Right) -> Self {
        Self { strike, right }
    }

    pub fn key(&self) -> ContractKey {
        ContractKey {
            strike_millis: (self.strike * 1000.0).round() as i64,
            right: self.right,
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.strike, self.right)
    }
}

/// A price that is zero, negative or not finite carries no information.
pub fn is_missing_price(p: f64) -> bool {
    !(p.is_finite() && p > 0.0)
}

fn lerp(a: f64, b: f64, weight: f64) -> f64 {
    a + (b - a) * weight
}

/// Fraction of the way from `before` to `after` that `at` lies.
fn weight_between(before: NaiveDateTime, after: NaiveDateTime, at: NaiveDateTime) -> f64 {
    let span = (after - before).num_milliseconds();
    if span <= 0 {
        return 0.0;
    }
    (at - before).num_milliseconds() as f64 / span as f64
}

/// A row that belongs to a time series inside a partition.
///
/// Partitions are sorted by `(series_key, timestamp)`. The corrector is
/// generic over this trait so the same repair logic serves underlying bars,
/// option bars and greeks.
pub trait SeriesRow: Clone + Send + Sync {
    type Key: Ord + Clone + fmt::Debug + Send + Sync;

    fn series_key(&self) -> Self::Key;

    fn timestamp(&self) -> NaiveDateTime;

    fn quality(&self) -> RowQuality;

    fn set_quality(&mut self, quality: RowQuality);

    /// The fields inspected for zero-degeneracy.
    fn price_fields(&self) -> Vec<f64>;

    /// Repair a partially missing row from its own reference price.
    ///
    /// Returns true if any field changed.
    fn fill_partial(&mut self) -> bool;

    /// A row at `timestamp` linearly interpolated between two valid rows of
    /// the same series.
    fn interpolate(before: &Self, after: &Self, timestamp: NaiveDateTime) -> Self;

    /// Every price field is missing.
    fn is_degenerate(&self) -> bool {
        self.price_fields().into_iter().all(is_missing_price)
    }

    /// Some, but not all, price fields are missing.
    fn is_partial(&self) -> bool {
        let fields = self.price_fields();
        let missing = fields.iter().filter(|p| is_missing_price(**p)).count();
        missing > 0 && missing < fields.len()
    }
}

/// One OHLC bar at an intraday timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcRow {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<u64>,
    #[serde(default)]
    pub quality: RowQuality,
}

impl OhlcRow {
    pub fn new(timestamp: NaiveDateTime, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume: None,
            quality: RowQuality::Original,
        }
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// high >= low and high/low bracket open and close.
    pub fn is_sane(&self) -> bool {
        if self.price_fields().into_iter().any(is_missing_price) {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

impl SeriesRow for OhlcRow {
    type Key = ();

    fn series_key(&self) -> Self::Key {}

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    fn quality(&self) -> RowQuality {
        self.quality
    }

    fn set_quality(&mut self, quality: RowQuality) {
        self.quality = quality;
    }

    fn price_fields(&self) -> Vec<f64> {
        vec![self.open, self.high, self.low, self.close]
    }

    /// A bar whose prices are all present but contradict each other
    /// (high below low) is treated as degenerate too.
    fn is_degenerate(&self) -> bool {
        let fields = self.price_fields();
        fields.iter().all(|p| is_missing_price(*p))
            || (!fields.iter().any(|p| is_missing_price(*p)) && self.high < self.low)
    }

    fn fill_partial(&mut self) -> bool {
        let reference = [self.close, self.open, self.high, self.low]
            .into_iter()
            .find(|p| !is_missing_price(*p));
        let Some(reference) = reference else {
            return false;
        };

        let mut changed = false;
        for field in [
            &mut self.open,
            &mut self.high,
            &mut self.low,
            &mut self.close,
        ] {
            if is_missing_price(*field) {
                *field = reference;
                changed = true;
            }
        }
        if changed {
            self.high = self.high.max(self.open).max(self.close).max(self.low);
            self.low = self.low.min(self.open).min(self.close).min(self.high);
        }
        changed
    }

    fn interpolate(before: &Self, after: &Self, timestamp: NaiveDateTime) -> Self {
        let w = weight_between(before.timestamp, after.timestamp, timestamp);
        Self {
            timestamp,
            open: lerp(before.open, after.open, w),
            high: lerp(before.high, after.high, w),
            low: lerp(before.low, after.low, w),
            close: lerp(before.close, after.close, w),
            volume: None,
            quality: RowQuality::Interpolated,
        }
    }
}

/// One OHLC bar of a single option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionOhlcRow {
    pub contract: Contract,
    pub bar: OhlcRow,
}

impl SeriesRow for OptionOhlcRow {
    type Key = ContractKey;

    fn series_key(&self) -> Self::Key {
        self.contract.key()
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.bar.timestamp
    }

    fn quality(&self) -> RowQuality {
        self.bar.quality
    }

    fn set_quality(&mut self, quality: RowQuality) {
        self.bar.quality = quality;
    }

    fn price_fields(&self) -> Vec<f64> {
        self.bar.price_fields()
    }

    fn is_degenerate(&self) -> bool {
        self.bar.is_degenerate()
    }

    fn fill_partial(&mut self) -> bool {
        self.bar.fill_partial()
    }

    fn interpolate(before: &Self, after: &Self, timestamp: NaiveDateTime) -> Self {
        Self {
            contract: before.contract,
            bar: OhlcRow::interpolate(&before.bar, &after.bar, timestamp),
        }
    }
}

/// First-order greeks and quote of a single option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreeksRow {
    pub contract: Contract,
    pub timestamp: NaiveDateTime,
    pub bid: f64,
    pub ask: f64,
    pub delta: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub implied_vol: f64,
    pub underlying_price: f64,
    #[serde(default)]
    pub quality: RowQuality,
}

impl GreeksRow {
    /// Quote midpoint, if both sides are present.
    pub fn mid(&self) -> Option<f64> {
        if is_missing_price(self.bid) || is_missing_price(self.ask) {
            return None;
        }
        Some((self.bid + self.ask) / 2.0)
    }
}

impl SeriesRow for GreeksRow {
    type Key = ContractKey;

    fn series_key(&self) -> Self::Key {
        self.contract.key()
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    fn quality(&self) -> RowQuality {
        self.quality
    }

    fn set_quality(&mut self, quality: RowQuality) {
        self.quality = quality;
    }

    fn price_fields(&self) -> Vec<f64> {
        vec![self.bid, self.ask, self.underlying_price]
    }

    // A zero bid on a far out-of-the-money contract is a real quote, so a
    // greeks row has no in-row reference to repair from.
    fn fill_partial(&mut self) -> bool {
        false
    }

    fn interpolate(before: &Self, after: &Self, timestamp: NaiveDateTime) -> Self {
        let w = weight_between(before.timestamp, after.timestamp, timestamp);
        Self {
            contract: before.contract,
            timestamp,
            bid: lerp(before.bid, after.bid, w),
            ask: lerp(before.ask, after.ask, w),
            delta: lerp(before.delta, after.delta, w),
            theta: lerp(before.theta, after.theta, w),
            vega: lerp(before.vega, after.vega, w),
            rho: lerp(before.rho, after.rho, w),
            implied_vol: lerp(before.implied_vol, after.implied_vol, w),
            underlying_price: lerp(before.underlying_price, after.underlying_price, w),
            quality: RowQuality::Interpolated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn all_zero_bar_is_degenerate() {
        let row = OhlcRow::new(ts(9, 30), 0.0, 0.0, 0.0, 0.0);
        assert!(row.is_degenerate());
        assert!(!row.is_partial());
    }

    #[test]
    fn nan_counts_as_missing() {
        let row = OhlcRow::new(ts(9, 30), f64::NAN, 0.0, f64::NAN, 0.0);
        assert!(row.is_degenerate());
    }

    #[test]
    fn inverted_bar_is_degenerate() {
        let row = OhlcRow::new(ts(9, 30), 10.0, 9.0, 11.0, 10.0);
        assert!(row.is_degenerate());
    }

    #[test]
    fn partial_bar_filled_from_close() {
        let mut row = OhlcRow::new(ts(9, 30), 0.0, 101.0, 0.0, 100.0);
        assert!(row.is_partial());
        assert!(row.fill_partial());
        assert_eq!(row.open, 100.0);
        assert_eq!(row.low, 100.0);
        assert_eq!(row.high, 101.0);
        assert!(row.is_sane());
    }

    #[test]
    fn interpolated_bar_is_midpoint() {
        let a = OhlcRow::new(ts(9, 30), 100.0, 102.0, 99.0, 101.0).with_volume(10);
        let b = OhlcRow::new(ts(9, 32), 102.0, 104.0, 101.0, 103.0).with_volume(20);
        let mid = OhlcRow::interpolate(&a, &b, ts(9, 31));
        assert_eq!(mid.open, 101.0);
        assert_eq!(mid.close, 102.0);
        assert_eq!(mid.volume, None);
        assert_eq!(mid.quality, RowQuality::Interpolated);
    }

    #[test]
    fn greeks_zero_bid_is_partial_not_degenerate() {
        let row = GreeksRow {
            contract: Contract::new(4800.0, Right::Put),
            timestamp: ts(9, 30),
            bid: 0.0,
            ask: 0.05,
            delta: -0.01,
            theta: -0.1,
            vega: 0.01,
            rho: 0.0,
            implied_vol: 0.3,
            underlying_price: 4750.0,
            quality: RowQuality::Original,
        };
        assert!(!row.is_degenerate());
        assert!(row.mid().is_none());
        let mut copy = row.clone();
        assert!(!copy.fill_partial());
        assert_eq!(copy, row);
    }

    #[test]
    fn contract_key_orders_by_strike_then_right() {
        let a = Contract::new(4750.0, Right::Put).key();
        let b = Contract::new(4750.0, Right::Call).key();
        let c = Contract::new(4755.5, Right::Call).key();
        assert!(b < a);
        assert!(a < c);
        assert_eq!(c.strike_millis, 4_755_500);
    }

    #[test]
    fn right_parses_terminal_spellings() {
        assert_eq!(Right::parse_terminal("call"), Some(Right::Call));
        assert_eq!(Right::parse_terminal("P"), Some(Right::Put));
        assert_eq!(Right::parse_terminal("x"), None);
    }
}
