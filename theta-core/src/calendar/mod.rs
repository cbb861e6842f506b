//! Trading calendar and expiration selection.
//!
//! Everything here is pure: the holiday set is loaded once per run from the
//! terminal and passed in explicitly.

pub mod policy;

pub use policy::{policy_for, SymbolClass, SymbolPolicy, UnderlyingSource};

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;
use thiserror::Error;

/// Upper bound on weeks scanned when looking for a VIX-style expiration.
const MAX_VIX_WEEKS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("no trading day found starting from {from}")]
    NoTradingDayFound { from: NaiveDate },

    #[error("invalid date: {0}")]
    InvalidDate(String),
}

/// Closure type reported by the terminal's holiday endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolidayKind {
    FullClose,
    EarlyClose,
    Other,
}

impl HolidayKind {
    pub fn parse_terminal(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_close" => HolidayKind::FullClose,
            "early_close" => HolidayKind::EarlyClose,
            _ => HolidayKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolidayEntry {
    pub date: NaiveDate,
    pub kind: HolidayKind,
    pub name: Option<String>,
}

/// Full-close holidays plus the weekend rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Weekends only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Early closes are still trading days, so only full closes are kept.
    pub fn from_terminal_entries(entries: &[HolidayEntry]) -> Self {
        Self::new(
            entries
                .iter()
                .filter(|e| e.kind == HolidayKind::FullClose)
                .map(|e| e.date),
        )
    }

    pub fn extend(&mut self, holidays: impl IntoIterator<Item = NaiveDate>) {
        self.holidays.extend(holidays);
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn holidays(&self) -> impl Iterator<Item = &NaiveDate> {
        self.holidays.iter()
    }

    pub fn len(&self) -> usize {
        self.holidays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holidays.is_empty()
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// False on Saturdays, Sundays and full-close holidays.
pub fn is_trading_day(date: NaiveDate, calendar: &TradingCalendar) -> bool {
    !is_weekend(date) && !calendar.is_holiday(date)
}

fn monday_of_week(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// The Wednesday of `date`'s Monday-based week.
pub fn wednesday_of_week(date: NaiveDate) -> NaiveDate {
    monday_of_week(date) + Duration::days(2)
}

/// Scan from the Friday of `date`'s week back to Monday for a trading day.
pub fn last_trading_day_of_week(
    date: NaiveDate,
    calendar: &TradingCalendar,
) -> Result<NaiveDate, CalendarError> {
    let monday = monday_of_week(date);
    (0..5)
        .rev()
        .map(|offset| monday + Duration::days(offset))
        .find(|d| is_trading_day(*d, calendar))
        .ok_or(CalendarError::NoTradingDayFound { from: date })
}

/// First Wednesday-settled expiration on or after `date`.
///
/// Each week's candidate is its Wednesday, moved back a day at a time (not
/// past that week's Monday) while it is not a trading day.
pub fn get_next_valid_vix_expiration(
    date: NaiveDate,
    calendar: &TradingCalendar,
) -> Result<NaiveDate, CalendarError> {
    let mut week = date;
    for _ in 0..MAX_VIX_WEEKS {
        let monday = monday_of_week(week);
        let mut candidate = wednesday_of_week(week);
        while !is_trading_day(candidate, calendar) && candidate > monday {
            candidate -= Duration::days(1);
        }
        if is_trading_day(candidate, calendar) && candidate >= date {
            return Ok(candidate);
        }
        week += Duration::days(7);
    }
    Err(CalendarError::NoTradingDayFound { from: date })
}

/// Expirations to download for `symbol` as of `as_of`.
///
/// Standard symbols get today (when it trades) plus the last trading day of
/// next week; VIX-family symbols get the next Wednesday-settled expiration.
pub fn select_target_expirations(
    symbol: &str,
    as_of: NaiveDate,
    calendar: &TradingCalendar,
) -> Result<BTreeSet<NaiveDate>, CalendarError> {
    let mut targets = BTreeSet::new();
    match policy_for(symbol).class {
        SymbolClass::Standard => {
            if is_trading_day(as_of, calendar) {
                targets.insert(as_of);
            }
            targets.insert(last_trading_day_of_week(
                as_of + Duration::days(7),
                calendar,
            )?);
        }
        SymbolClass::VixFamily => {
            targets.insert(get_next_valid_vix_expiration(as_of, calendar)?);
        }
    }
    Ok(targets)
}

/// Trading days in `[start, end]`, ascending.
pub fn trading_days(start: NaiveDate, end: NaiveDate, calendar: &TradingCalendar) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| is_trading_day(*d, calendar))
        .collect()
}

/// Distinct calendar years touched by `[start, end]`.
pub fn years_in_range(start: NaiveDate, end: NaiveDate) -> Vec<i32> {
    (start.year()..=end.year()).collect()
}

/// Accepts `YYYYMMDD` (the terminal's request format) and `YYYY-MM-DD`.
pub fn parse_terminal_date(s: &str) -> Result<NaiveDate, CalendarError> {
    let s = s.trim();
    let s = s.get(..10).filter(|p| p.contains('-')).unwrap_or(s);
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .map_err(|_| CalendarError::InvalidDate(s.to_string()))
}

/// Dates go to the terminal as `YYYYMMDD`.
pub fn format_terminal_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
