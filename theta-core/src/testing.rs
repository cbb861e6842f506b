//! In-memory terminal fakes shared by tests and benchmarks.
//!
//! `ScriptedTransport` stands in for HTTP; `StaticSource` stands in for the
//! whole terminal at the `TerminalSource` level.

use crate::calendar::{HolidayEntry, HolidayKind};
use crate::client::TerminalSource;
use crate::domain::{
    Contract, DataKind, GreeksRow, OhlcRow, OptionOhlcRow, PartitionRows, Right, RowQuality,
    SeriesRow, WorkUnit,
};
use crate::requester::{HttpResponse, HttpTransport, RequestError, TransportError};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

// ── Scripted HTTP ───────────────────────────────────────────────────

struct Rule {
    endpoint: String,
    when: Option<(String, String)>,
    response: Result<HttpResponse, TransportError>,
    repeat: bool,
}

/// Replays queued responses per endpoint. Unscripted requests get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &self,
        endpoint: &str,
        when: Option<(&str, &str)>,
        response: Result<HttpResponse, TransportError>,
        repeat: bool,
    ) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                endpoint: endpoint.to_string(),
                when: when.map(|(k, v)| (k.to_string(), v.to_string())),
                response,
                repeat,
            });
        }
    }

    pub fn push_ok(&self, endpoint: &str, body: &str) {
        self.push(endpoint, None, Ok(HttpResponse::new(200, body)), false);
    }

    /// Queue a 200 that only answers requests carrying `param`.
    pub fn push_ok_when(&self, endpoint: &str, param: (&str, &str), body: &str) {
        self.push(endpoint, Some(param), Ok(HttpResponse::new(200, body)), false);
    }

    pub fn push_status(&self, endpoint: &str, status: u16) {
        self.push(
            endpoint,
            None,
            Ok(HttpResponse::new(status, format!("status {status}"))),
            false,
        );
    }

    pub fn push_error(&self, endpoint: &str, error: TransportError) {
        self.push(endpoint, None, Err(error), false);
    }

    /// Answer every request to `endpoint` with `status` from now on.
    pub fn always_status(&self, endpoint: &str, status: u16) {
        self.push(
            endpoint,
            None,
            Ok(HttpResponse::new(status, format!("status {status}"))),
            true,
        );
    }

    pub fn always_ok(&self, endpoint: &str, body: &str) {
        self.push(endpoint, None, Ok(HttpResponse::new(200, body)), true);
    }

    /// Every request seen: (url, query params).
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|(url, _)| url).collect()
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.requests()
            .iter()
            .filter(|(url, _)| url.ends_with(endpoint))
            .count()
    }
}

impl HttpTransport for ScriptedTransport {
    fn get(&self, url: &str, params: &[(String, String)]) -> Result<HttpResponse, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((url.to_string(), params.to_vec()));
        }
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| TransportError::Other("script lock poisoned".into()))?;
        let pos = rules.iter().position(|r| {
            url.ends_with(&r.endpoint)
                && r.when
                    .as_ref()
                    .map_or(true, |(k, v)| params.iter().any(|(pk, pv)| pk == k && pv == v))
        });
        match pos {
            Some(i) if rules[i].repeat => rules[i].response.clone(),
            Some(i) => rules.remove(i).response,
            None => Ok(HttpResponse::new(404, "no scripted response")),
        }
    }
}

// ── Static terminal ─────────────────────────────────────────────────

type UnitFn = dyn Fn(&WorkUnit) -> Result<PartitionRows, RequestError> + Send + Sync;
type ExpirationsFn = dyn Fn(&str, NaiveDate) -> Vec<NaiveDate> + Send + Sync;

/// A `TerminalSource` answering from closures, with scripted per-unit
/// failures and call counting.
pub struct StaticSource {
    holidays: Vec<HolidayEntry>,
    fetch: Box<UnitFn>,
    refetch: Option<Box<UnitFn>>,
    expirations: Option<Box<ExpirationsFn>>,
    failures: Mutex<HashMap<WorkUnit, VecDeque<RequestError>>>,
    fetches: Mutex<Vec<WorkUnit>>,
    refetches: Mutex<Vec<(WorkUnit, Option<Contract>)>>,
}

impl StaticSource {
    pub fn new(
        fetch: impl Fn(&WorkUnit) -> Result<PartitionRows, RequestError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            holidays: Vec::new(),
            fetch: Box::new(fetch),
            refetch: None,
            expirations: None,
            failures: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            refetches: Mutex::new(Vec::new()),
        }
    }

    /// Every unit gets `bars` synthetic rows.
    pub fn synthetic(bars: usize) -> Self {
        Self::new(move |unit| Ok(sample_rows(unit, bars)))
    }

    pub fn with_full_closes(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(dates.into_iter().map(|date| HolidayEntry {
            date,
            kind: HolidayKind::FullClose,
            name: None,
        }));
        self
    }

    pub fn with_refetch(
        mut self,
        refetch: impl Fn(&WorkUnit) -> Result<PartitionRows, RequestError> + Send + Sync + 'static,
    ) -> Self {
        self.refetch = Some(Box::new(refetch));
        self
    }

    pub fn with_expirations(
        mut self,
        expirations: impl Fn(&str, NaiveDate) -> Vec<NaiveDate> + Send + Sync + 'static,
    ) -> Self {
        self.expirations = Some(Box::new(expirations));
        self
    }

    /// Fail the next fetches of `unit` with `errors`, in order.
    pub fn fail_next(&self, unit: &WorkUnit, errors: impl IntoIterator<Item = RequestError>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(unit.clone()).or_default().extend(errors);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn fetches_of(&self, unit: &WorkUnit) -> usize {
        self.fetches
            .lock()
            .map(|f| f.iter().filter(|u| *u == unit).count())
            .unwrap_or(0)
    }

    pub fn refetch_count(&self) -> usize {
        self.refetches.lock().map(|f| f.len()).unwrap_or(0)
    }
}

fn keep_contract<T: SeriesRow<Key = crate::domain::ContractKey>>(
    rows: Vec<T>,
    contract: Contract,
) -> Vec<T> {
    let key = contract.key();
    rows.into_iter().filter(|r| r.series_key() == key).collect()
}

impl TerminalSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn holidays(&self, year: i32) -> Result<Vec<HolidayEntry>, RequestError> {
        Ok(self
            .holidays
            .iter()
            .filter(|h| chrono::Datelike::year(&h.date) == year)
            .cloned()
            .collect())
    }

    fn list_expirations(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Vec<NaiveDate>, RequestError> {
        match &self.expirations {
            Some(f) => Ok(f(symbol, date)),
            None => Err(RequestError::NoData {
                endpoint: "static".into(),
                message: "no expiration listing configured".into(),
            }),
        }
    }

    fn fetch_unit(&self, unit: &WorkUnit) -> Result<PartitionRows, RequestError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push(unit.clone());
        }
        let scripted = self
            .failures
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(unit).and_then(VecDeque::pop_front));
        if let Some(err) = scripted {
            return Err(err);
        }
        (self.fetch)(unit)
    }

    fn refetch_series(
        &self,
        unit: &WorkUnit,
        contract: Option<Contract>,
    ) -> Result<PartitionRows, RequestError> {
        if let Ok(mut refetches) = self.refetches.lock() {
            refetches.push((unit.clone(), contract));
        }
        let rows = match &self.refetch {
            Some(f) => f(unit)?,
            None => (self.fetch)(unit)?,
        };
        Ok(match (rows, contract) {
            (PartitionRows::OptionOhlc(r), Some(c)) => PartitionRows::OptionOhlc(keep_contract(r, c)),
            (PartitionRows::Greeks(r), Some(c)) => PartitionRows::Greeks(keep_contract(r, c)),
            (rows, _) => rows,
        })
    }
}

// ── Synthetic rows ──────────────────────────────────────────────────

fn session_open(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(9, 30, 0).unwrap_or_default()
}

/// `bars` one-minute rows per series for a unit: one underlying series, or
/// a call and a put at two strikes for option kinds.
pub fn sample_rows(unit: &WorkUnit, bars: usize) -> PartitionRows {
    let open = session_open(unit.trade_date());
    let bar = |i: usize, base: f64| {
        let p = base + i as f64 * 0.25;
        OhlcRow {
            timestamp: open + Duration::minutes(i as i64),
            open: p,
            high: p + 0.5,
            low: p - 0.5,
            close: p + 0.25,
            volume: Some(100 + i as u64),
            quality: RowQuality::Original,
        }
    };
    let contracts = [
        Contract::new(4750.0, Right::Call),
        Contract::new(4750.0, Right::Put),
        Contract::new(4800.0, Right::Call),
        Contract::new(4800.0, Right::Put),
    ];

    match unit.kind() {
        DataKind::UnderlyingOhlc => {
            PartitionRows::Underlying((0..bars).map(|i| bar(i, 4750.0)).collect())
        }
        DataKind::OptionOhlc => PartitionRows::OptionOhlc(
            contracts
                .iter()
                .flat_map(|c| {
                    (0..bars).map(move |i| OptionOhlcRow {
                        contract: *c,
                        bar: bar(i, 10.0),
                    })
                })
                .collect(),
        ),
        DataKind::OptionGreeks => PartitionRows::Greeks(
            contracts
                .iter()
                .flat_map(|c| {
                    (0..bars).map(move |i| GreeksRow {
                        contract: *c,
                        timestamp: open + Duration::minutes(i as i64),
                        bid: 10.0 + i as f64 * 0.1,
                        ask: 10.2 + i as f64 * 0.1,
                        delta: 0.5,
                        theta: -2.0,
                        vega: 1.5,
                        rho: 0.05,
                        implied_vol: 0.14,
                        underlying_price: 4750.0 + i as f64 * 0.25,
                        quality: RowQuality::Original,
                    })
                })
                .collect(),
        ),
    }
}
