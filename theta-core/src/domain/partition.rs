//! Partition contents and canonical row ordering.

use super::row::{GreeksRow, OhlcRow, OptionOhlcRow, SeriesRow};
use super::work_unit::{DataKind, WorkUnit};
use thiserror::Error;

/// The rows of one partition, typed by data kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionRows {
    Underlying(Vec<OhlcRow>),
    OptionOhlc(Vec<OptionOhlcRow>),
    Greeks(Vec<GreeksRow>),
}

impl PartitionRows {
    /// An empty row set of the shape `kind` expects.
    pub fn empty(kind: DataKind) -> Self {
        match kind {
            DataKind::UnderlyingOhlc => PartitionRows::Underlying(Vec::new()),
            DataKind::OptionOhlc => PartitionRows::OptionOhlc(Vec::new()),
            DataKind::OptionGreeks => PartitionRows::Greeks(Vec::new()),
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            PartitionRows::Underlying(_) => DataKind::UnderlyingOhlc,
            PartitionRows::OptionOhlc(_) => DataKind::OptionOhlc,
            PartitionRows::Greeks(_) => DataKind::OptionGreeks,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PartitionRows::Underlying(r) => r.len(),
            PartitionRows::OptionOhlc(r) => r.len(),
            PartitionRows::Greeks(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row ordering violation found in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rows out of order at index {index}: {detail}")]
pub struct OrderingError {
    pub index: usize,
    pub detail: String,
}

/// One work unit's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionData {
    pub unit: WorkUnit,
    pub rows: PartitionRows,
}

impl PartitionData {
    pub fn new(unit: WorkUnit, rows: PartitionRows) -> Self {
        Self { unit, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort by (series, timestamp) and drop duplicate timestamps.
    pub fn canonicalize(&mut self) {
        match &mut self.rows {
            PartitionRows::Underlying(r) => canonicalize(r),
            PartitionRows::OptionOhlc(r) => canonicalize(r),
            PartitionRows::Greeks(r) => canonicalize(r),
        }
    }

    pub fn check_ordering(&self) -> Result<(), OrderingError> {
        match &self.rows {
            PartitionRows::Underlying(r) => check_ordering(r),
            PartitionRows::OptionOhlc(r) => check_ordering(r),
            PartitionRows::Greeks(r) => check_ordering(r),
        }
    }
}

/// Stable sort by `(series_key, timestamp)`; for duplicate keys the row seen
/// last wins.
pub fn canonicalize<T: SeriesRow>(rows: &mut Vec<T>) {
    rows.sort_by(|a, b| {
        a.series_key()
            .cmp(&b.series_key())
            .then(a.timestamp().cmp(&b.timestamp()))
    });

    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows.drain(..) {
        match out.last_mut() {
            Some(last)
                if last.series_key() == row.series_key() && last.timestamp() == row.timestamp() =>
            {
                *last = row;
            }
            _ => out.push(row),
        }
    }
    *rows = out;
}

/// Within each series, timestamps must be strictly increasing.
pub fn check_ordering<T: SeriesRow>(rows: &[T]) -> Result<(), OrderingError> {
    for (i, pair) in rows.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        let key_order = a.series_key().cmp(&b.series_key());
        let ordered = key_order.is_lt() || (key_order.is_eq() && a.timestamp() < b.timestamp());
        if !ordered {
            return Err(OrderingError {
                index: i + 1,
                detail: format!(
                    "{:?}@{} followed by {:?}@{}",
                    a.series_key(),
                    a.timestamp(),
                    b.series_key(),
                    b.timestamp()
                ),
            });
        }
    }
    Ok(())
}

/// Index ranges `[start, end)` of consecutive rows sharing a series key.
pub fn series_ranges<T: SeriesRow>(rows: &[T]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in 1..=rows.len() {
        if i == rows.len() || rows[i].series_key() != rows[start].series_key() {
            ranges.push(start..i);
            start = i;
        }
    }
    ranges
}
