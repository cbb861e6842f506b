//! Terminal JSON shapes and their conversion into domain rows.
//!
//! The v3 terminal is not consistent about shapes: list endpoints return bare
//! values or objects, history endpoints return either flat rows or
//! `{contract, data[]}` groups, and timestamps come as epoch millis or ISO
//! strings. Everything is decoded leniently into [`WireRow`] first.

use crate::calendar::{parse_terminal_date, HolidayEntry, HolidayKind};
use crate::domain::{Contract, GreeksRow, OhlcRow, OptionOhlcRow, Right, RowQuality};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Body {
    Rows(Vec<Value>),
    Envelope {
        #[serde(default)]
        response: Option<Vec<Value>>,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// Extract the item list from a response body.
///
/// An empty body is an empty list; a non-null `error` field is an error.
pub(crate) fn decode_items(body: &str) -> Result<Vec<Value>, String> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Body = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
    match parsed {
        Body::Rows(items) => Ok(items),
        Body::Envelope {
            error: Some(err), ..
        } if !err.is_null() => Err(format!("terminal error: {err}")),
        Body::Envelope {
            response: Some(items),
            ..
        } => Ok(items),
        Body::Envelope { .. } => Err("response has no 'response' array".into()),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DateValue {
    Number(i64),
    Text(String),
}

impl DateValue {
    fn to_date(&self) -> Option<NaiveDate> {
        match self {
            DateValue::Number(n) => parse_terminal_date(&n.to_string()).ok(),
            DateValue::Text(s) => parse_terminal_date(s).ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpirationItem {
    Object { expiration: DateValue },
    Bare(DateValue),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StrikeItem {
    Object {
        #[serde(alias = "value")]
        strike: f64,
    },
    Bare(f64),
}

pub(crate) fn decode_expirations(items: Vec<Value>) -> Result<Vec<NaiveDate>, String> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let parsed: ExpirationItem =
            serde_json::from_value(item.clone()).map_err(|e| format!("expiration {item}: {e}"))?;
        let value = match parsed {
            ExpirationItem::Object { expiration } => expiration,
            ExpirationItem::Bare(v) => v,
        };
        let date = value
            .to_date()
            .ok_or_else(|| format!("unparseable expiration {item}"))?;
        out.push(date);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

pub(crate) fn decode_strikes(items: Vec<Value>) -> Result<Vec<f64>, String> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let parsed: StrikeItem =
            serde_json::from_value(item.clone()).map_err(|e| format!("strike {item}: {e}"))?;
        out.push(match parsed {
            StrikeItem::Object { strike } => strike,
            StrikeItem::Bare(v) => v,
        });
    }
    out.retain(|s| s.is_finite());
    out.sort_by(|a, b| a.total_cmp(b));
    out.dedup();
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct WireHoliday {
    date: DateValue,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub(crate) fn decode_holidays(items: Vec<Value>) -> Result<Vec<HolidayEntry>, String> {
    items
        .into_iter()
        .map(|item| {
            let h: WireHoliday =
                serde_json::from_value(item.clone()).map_err(|e| format!("holiday {item}: {e}"))?;
            let date = h
                .date
                .to_date()
                .ok_or_else(|| format!("unparseable holiday date {item}"))?;
            Ok(HolidayEntry {
                date,
                kind: h
                    .kind
                    .as_deref()
                    .map(HolidayKind::parse_terminal)
                    .unwrap_or(HolidayKind::FullClose),
                name: h.name,
            })
        })
        .collect()
}

/// Flatten `{contract, data[]}` groups into one object per data row, with
/// the contract's fields merged in. Flat rows pass through.
pub(crate) fn flatten_rows(items: Vec<Value>) -> Vec<Map<String, Value>> {
    let mut rows = Vec::new();
    for item in items {
        let Value::Object(mut obj) = item else {
            continue;
        };
        match obj.remove("data") {
            Some(Value::Array(data)) => {
                let contract = match obj.remove("contract") {
                    Some(Value::Object(c)) => c,
                    _ => obj,
                };
                for entry in data {
                    if let Value::Object(fields) = entry {
                        let mut merged = contract.clone();
                        merged.extend(fields);
                        rows.push(merged);
                    }
                }
            }
            Some(other) => {
                obj.insert("data".to_string(), other);
                rows.push(obj);
            }
            None => rows.push(obj),
        }
    }
    rows
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TimestampValue {
    Millis(i64),
    Float(f64),
    Text(String),
}

fn parse_timestamp(value: &TimestampValue) -> Option<NaiveDateTime> {
    match value {
        TimestampValue::Millis(ms) => DateTime::from_timestamp_millis(*ms).map(|d| d.naive_utc()),
        TimestampValue::Float(ms) => {
            DateTime::from_timestamp_millis(*ms as i64).map(|d| d.naive_utc())
        }
        TimestampValue::Text(s) => {
            let s = s.trim().trim_end_matches('Z');
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        }
    }
}

/// Every field any history endpoint may send. Missing fields stay `None`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct WireRow {
    timestamp: Option<TimestampValue>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
    strike: Option<f64>,
    right: Option<String>,
    bid: Option<f64>,
    ask: Option<f64>,
    delta: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    rho: Option<f64>,
    #[serde(alias = "iv")]
    implied_vol: Option<f64>,
    underlying_price: Option<f64>,
}

fn price(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

impl WireRow {
    pub(crate) fn from_map(map: Map<String, Value>) -> Result<Self, String> {
        serde_json::from_value(Value::Object(map)).map_err(|e| format!("row: {e}"))
    }

    fn timestamp(&self) -> Result<NaiveDateTime, String> {
        self.timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .ok_or_else(|| format!("row has no valid timestamp: {:?}", self.timestamp))
    }

    fn contract(&self) -> Result<Contract, String> {
        let strike = self.strike.ok_or("row has no strike")?;
        let right = self
            .right
            .as_deref()
            .and_then(Right::parse_terminal)
            .ok_or_else(|| format!("row has no valid right: {:?}", self.right))?;
        Ok(Contract::new(strike, right))
    }

    pub(crate) fn to_ohlc(&self) -> Result<OhlcRow, String> {
        Ok(OhlcRow {
            timestamp: self.timestamp()?,
            open: price(self.open),
            high: price(self.high),
            low: price(self.low),
            close: price(self.close),
            volume: self.volume.filter(|v| *v >= 0.0).map(|v| v as u64),
            quality: RowQuality::Original,
        })
    }

    pub(crate) fn to_option_ohlc(&self) -> Result<OptionOhlcRow, String> {
        Ok(OptionOhlcRow {
            contract: self.contract()?,
            bar: self.to_ohlc()?,
        })
    }

    pub(crate) fn to_greeks(&self) -> Result<GreeksRow, String> {
        Ok(GreeksRow {
            contract: self.contract()?,
            timestamp: self.timestamp()?,
            bid: price(self.bid),
            ask: price(self.ask),
            delta: price(self.delta),
            theta: price(self.theta),
            vega: price(self.vega),
            rho: price(self.rho),
            implied_vol: price(self.implied_vol),
            underlying_price: price(self.underlying_price),
            quality: RowQuality::Original,
        })
    }
}

/// Decode every row of a history response with `convert`.
pub(crate) fn decode_rows<T>(
    items: Vec<Value>,
    convert: impl Fn(&WireRow) -> Result<T, String>,
) -> Result<Vec<T>, String> {
    flatten_rows(items)
        .into_iter()
        .map(|m| WireRow::from_map(m).and_then(|r| convert(&r)))
        .collect()
}
