//! Typed façade over the terminal's REST endpoints.
//!
//! [`ThetaClient`] owns a [`ResilientRequester`] and turns JSON responses
//! into domain rows. The engine and corrector only see the
//! [`TerminalSource`] trait so they can run against in-memory fakes.

pub mod spot_proxy;
mod wire;

use crate::calendar::{
    format_terminal_date, policy_for, HolidayEntry, TradingCalendar, UnderlyingSource,
};
use crate::domain::{Contract, DataKind, GreeksRow, OhlcRow, PartitionRows, Right, WorkUnit};
use crate::requester::{Params, RequestError, ResilientRequester};
use chrono::{Duration, NaiveDate};
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:25503/v3";

pub mod endpoints {
    pub const EXPIRATIONS: &str = "/option/list/expirations";
    pub const STRIKES: &str = "/option/list/strikes";
    pub const OPTION_OHLC: &str = "/option/history/ohlc";
    pub const OPTION_GREEKS: &str = "/option/history/greeks/first_order";
    pub const INDEX_OHLC: &str = "/index/history/ohlc";
    pub const STOCK_OHLC: &str = "/stock/history/ohlc";
    pub const HOLIDAYS: &str = "/calendar/year_holidays";
}

/// Number of listed expirations tried when deriving an underlying.
const SPOT_PROXY_EXPIRATIONS: usize = 2;

/// Which option history endpoint to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionHistoryKind {
    Ohlc,
    Greeks,
}

impl OptionHistoryKind {
    fn endpoint(self) -> &'static str {
        match self {
            OptionHistoryKind::Ohlc => endpoints::OPTION_OHLC,
            OptionHistoryKind::Greeks => endpoints::OPTION_GREEKS,
        }
    }

    fn for_kind(kind: DataKind) -> Option<Self> {
        match kind {
            DataKind::OptionOhlc => Some(OptionHistoryKind::Ohlc),
            DataKind::OptionGreeks => Some(OptionHistoryKind::Greeks),
            DataKind::UnderlyingOhlc => None,
        }
    }
}

/// Parse a terminal interval string (`500ms`, `1s`, `1m`, `1h`).
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    match unit {
        "ms" => Some(Duration::milliseconds(n)),
        "s" => Some(Duration::seconds(n)),
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        _ => None,
    }
}

/// What the engine and corrector need from the terminal.
pub trait TerminalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Holiday entries (all closure types) for a calendar year.
    fn holidays(&self, year: i32) -> Result<Vec<HolidayEntry>, RequestError>;

    /// Expirations listed for `symbol` on or after `date`.
    fn list_expirations(&self, symbol: &str, date: NaiveDate)
        -> Result<Vec<NaiveDate>, RequestError>;

    /// All rows for a work unit.
    fn fetch_unit(&self, unit: &WorkUnit) -> Result<PartitionRows, RequestError>;

    /// Rows for one series of a unit: a single contract for option kinds,
    /// the whole underlying otherwise.
    fn refetch_series(
        &self,
        unit: &WorkUnit,
        contract: Option<Contract>,
    ) -> Result<PartitionRows, RequestError>;

    /// Full-close calendar for every listed year.
    fn load_calendar(&self, years: &[i32]) -> Result<TradingCalendar, RequestError> {
        let mut entries = Vec::new();
        for year in years {
            entries.extend(self.holidays(*year)?);
        }
        Ok(TradingCalendar::from_terminal_entries(&entries))
    }
}

/// Client for a locally running terminal.
pub struct ThetaClient {
    requester: ResilientRequester,
    interval: String,
    spot_sample_interval: String,
}

impl ThetaClient {
    pub fn new(requester: ResilientRequester) -> Self {
        Self {
            requester,
            interval: "1m".to_string(),
            spot_sample_interval: "1s".to_string(),
        }
    }

    /// Bar interval for history requests (and spot-proxy buckets).
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    /// Greeks sampling interval used when reconstructing spot.
    pub fn with_spot_sample_interval(mut self, interval: impl Into<String>) -> Self {
        self.spot_sample_interval = interval.into();
        self
    }

    pub fn requester(&self) -> &ResilientRequester {
        &self.requester
    }

    fn request_items(&self, endpoint: &str, params: &Params) -> Result<Vec<Value>, RequestError> {
        let resp = self.requester.get(endpoint, params)?;
        wire::decode_items(&resp.body).map_err(|message| decode_error(endpoint, message))
    }

    pub fn get_expirations(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<NaiveDate>, RequestError> {
        let params = params(&[("symbol", symbol.to_string()), ("date", format_terminal_date(date))]);
        let items = self.request_items(endpoints::EXPIRATIONS, &params)?;
        let mut exps = wire::decode_expirations(items)
            .map_err(|m| decode_error(endpoints::EXPIRATIONS, m))?;
        exps.retain(|e| *e >= date);
        Ok(exps)
    }

    pub fn get_strikes(
        &self,
        symbol: &str,
        expiration: NaiveDate,
        date: NaiveDate,
    ) -> Result<Vec<f64>, RequestError> {
        let params = params(&[
            ("symbol", symbol.to_string()),
            ("expiration", format_terminal_date(expiration)),
            ("date", format_terminal_date(date)),
        ]);
        let items = self.request_items(endpoints::STRIKES, &params)?;
        wire::decode_strikes(items).map_err(|m| decode_error(endpoints::STRIKES, m))
    }

    /// Intraday history for one expiration: every contract when `contract`
    /// is `None`, otherwise just that strike and right.
    pub fn get_option_history(
        &self,
        symbol: &str,
        expiration: NaiveDate,
        date: NaiveDate,
        kind: OptionHistoryKind,
        contract: Option<Contract>,
    ) -> Result<PartitionRows, RequestError> {
        self.option_history_at(symbol, expiration, date, kind, contract, &self.interval)
    }

    fn option_history_at(
        &self,
        symbol: &str,
        expiration: NaiveDate,
        date: NaiveDate,
        kind: OptionHistoryKind,
        contract: Option<Contract>,
        interval: &str,
    ) -> Result<PartitionRows, RequestError> {
        let (strike, right) = match contract {
            Some(c) => (c.strike.to_string(), c.right.as_str().to_string()),
            None => ("*".to_string(), "both".to_string()),
        };
        let params = params(&[
            ("symbol", symbol.to_string()),
            ("expiration", format_terminal_date(expiration)),
            ("date", format_terminal_date(date)),
            ("strike", strike),
            ("right", right),
            ("interval", interval.to_string()),
        ]);
        let endpoint = kind.endpoint();
        let items = self.request_items(endpoint, &params)?;
        let rows = match kind {
            OptionHistoryKind::Ohlc => {
                wire::decode_rows(items, wire::WireRow::to_option_ohlc).map(PartitionRows::OptionOhlc)
            }
            OptionHistoryKind::Greeks => {
                wire::decode_rows(items, wire::WireRow::to_greeks).map(PartitionRows::Greeks)
            }
        };
        rows.map_err(|m| decode_error(endpoint, m))
    }

    fn underlying_history(
        &self,
        endpoint: &str,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<OhlcRow>, RequestError> {
        let params = params(&[
            ("symbol", symbol.to_string()),
            ("start_date", format_terminal_date(date)),
            ("end_date", format_terminal_date(date)),
            ("interval", self.interval.clone()),
        ]);
        let items = self.request_items(endpoint, &params)?;
        wire::decode_rows(items, wire::WireRow::to_ohlc).map_err(|m| decode_error(endpoint, m))
    }

    pub fn get_index_ohlc(&self, symbol: &str, date: NaiveDate) -> Result<Vec<OhlcRow>, RequestError> {
        self.underlying_history(endpoints::INDEX_OHLC, symbol, date)
    }

    pub fn get_stock_ohlc(&self, symbol: &str, date: NaiveDate) -> Result<Vec<OhlcRow>, RequestError> {
        self.underlying_history(endpoints::STOCK_OHLC, symbol, date)
    }

    pub fn get_holidays(&self, year: i32) -> Result<Vec<HolidayEntry>, RequestError> {
        let params = params(&[("year", year.to_string())]);
        let items = self.request_items(endpoints::HOLIDAYS, &params)?;
        wire::decode_holidays(items).map_err(|m| decode_error(endpoints::HOLIDAYS, m))
    }

    /// Underlying bars for `symbol` on `date`.
    ///
    /// Uses the index or stock endpoint when the symbol policy names one and
    /// falls back to spot-proxy reconstruction if that call fails with a
    /// non-transient error or returns nothing. Transient failures propagate
    /// so the caller's retry budget applies.
    pub fn fetch_underlying_ohlc(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<OhlcRow>, RequestError> {
        let policy = policy_for(symbol);
        let root = policy.underlying_symbol(symbol);
        let direct = match policy.underlying_source {
            UnderlyingSource::Index => Some(self.get_index_ohlc(&root, date)),
            UnderlyingSource::Stock => Some(self.get_stock_ohlc(&root, date)),
            UnderlyingSource::SpotProxy => None,
        };

        match direct {
            Some(Ok(rows)) if !rows.is_empty() => return Ok(rows),
            Some(Err(e)) if e.is_transient() || matches!(e, RequestError::Audit { .. }) => {
                return Err(e)
            }
            Some(Ok(_)) => {
                tracing::info!(symbol, %date, "direct underlying OHLC empty; deriving from greeks")
            }
            Some(Err(e)) => {
                tracing::info!(symbol, %date, error = %e, "direct underlying OHLC unavailable; deriving from greeks")
            }
            None => {}
        }
        self.derive_underlying_from_greeks(symbol, date)
    }

    fn derive_underlying_from_greeks(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<OhlcRow>, RequestError> {
        let bucket = parse_interval(&self.interval).unwrap_or_else(|| Duration::minutes(1));
        let expirations = self.get_expirations(symbol, date)?;
        if expirations.is_empty() {
            return Err(no_data(format!("no expirations listed for {symbol} on {date}")));
        }

        for expiration in expirations.iter().take(SPOT_PROXY_EXPIRATIONS) {
            let strikes = self.get_strikes(symbol, *expiration, date)?;
            let Some(strike) = spot_proxy::atm_strike(&strikes) else {
                continue;
            };

            let fetch = |right| {
                self.option_history_at(
                    symbol,
                    *expiration,
                    date,
                    OptionHistoryKind::Greeks,
                    Some(Contract::new(strike, right)),
                    &self.spot_sample_interval,
                )
            };
            let calls = greeks_or_empty(fetch(Right::Call))?;
            let puts = greeks_or_empty(fetch(Right::Put))?;

            let samples = spot_proxy::spot_samples(&calls, &puts, strike);
            if samples.is_empty() {
                continue;
            }
            tracing::debug!(symbol, %date, %expiration, strike, samples = samples.len(), "derived underlying from greeks");
            return Ok(spot_proxy::aggregate_ohlc(&samples, bucket));
        }

        Err(no_data(format!(
            "could not derive underlying for {symbol} on {date} from the first {SPOT_PROXY_EXPIRATIONS} expirations"
        )))
    }
}

/// A fatal answer for one leg (no such contract) just means no samples.
fn greeks_or_empty(
    result: Result<PartitionRows, RequestError>,
) -> Result<Vec<GreeksRow>, RequestError> {
    match result {
        Ok(PartitionRows::Greeks(rows)) => Ok(rows),
        Ok(_) => Ok(Vec::new()),
        Err(RequestError::Fatal { .. }) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

impl TerminalSource for ThetaClient {
    fn name(&self) -> &str {
        "theta_terminal"
    }

    fn holidays(&self, year: i32) -> Result<Vec<HolidayEntry>, RequestError> {
        self.get_holidays(year)
    }

    fn list_expirations(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<NaiveDate>, RequestError> {
        self.get_expirations(symbol, date)
    }

    fn fetch_unit(&self, unit: &WorkUnit) -> Result<PartitionRows, RequestError> {
        self.refetch_series(unit, None)
    }

    fn refetch_series(
        &self,
        unit: &WorkUnit,
        contract: Option<Contract>,
    ) -> Result<PartitionRows, RequestError> {
        match (OptionHistoryKind::for_kind(unit.kind()), unit.expiration()) {
            (Some(kind), Some(expiration)) => self.get_option_history(
                unit.symbol(),
                expiration,
                unit.trade_date(),
                kind,
                contract,
            ),
            _ => self
                .fetch_underlying_ohlc(unit.symbol(), unit.trade_date())
                .map(PartitionRows::Underlying),
        }
    }
}

fn params(pairs: &[(&str, String)]) -> Params {
    let mut p: Params = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    p.insert("format".to_string(), "json".to_string());
    p
}

fn decode_error(endpoint: &str, message: String) -> RequestError {
    RequestError::Decode {
        endpoint: endpoint.to_string(),
        message,
    }
}

fn no_data(message: String) -> RequestError {
    RequestError::NoData {
        endpoint: "spot_proxy".to_string(),
        message,
    }
}
