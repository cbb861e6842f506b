//! Row <-> DataFrame conversion for each partition kind.

use crate::domain::{
    Contract, DataKind, GreeksRow, OhlcRow, OptionOhlcRow, PartitionRows, Right, RowQuality,
};
use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;

const OHLC_COLUMNS: &[&str] = &["timestamp", "open", "high", "low", "close", "volume", "quality"];
const CONTRACT_COLUMNS: &[&str] = &["strike", "right"];
const GREEKS_COLUMNS: &[&str] = &[
    "timestamp",
    "bid",
    "ask",
    "delta",
    "theta",
    "vega",
    "rho",
    "implied_vol",
    "underlying_price",
    "quality",
];

/// Columns a partition of `kind` must contain.
pub fn expected_columns(kind: DataKind) -> Vec<&'static str> {
    match kind {
        DataKind::UnderlyingOhlc => OHLC_COLUMNS.to_vec(),
        DataKind::OptionOhlc => [CONTRACT_COLUMNS, OHLC_COLUMNS].concat(),
        DataKind::OptionGreeks => [CONTRACT_COLUMNS, GREEKS_COLUMNS].concat(),
    }
}

fn millis(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

fn timestamp_column(ts: Vec<i64>) -> PolarsResult<Column> {
    Column::new("timestamp".into(), ts).cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
}

fn quality_column(q: impl Iterator<Item = RowQuality>) -> Column {
    let values: Vec<&str> = q.map(RowQuality::as_str).collect();
    Column::new("quality".into(), values)
}

fn contract_columns<'a>(contracts: impl Iterator<Item = &'a Contract> + Clone) -> Vec<Column> {
    let strikes: Vec<f64> = contracts.clone().map(|c| c.strike).collect();
    let rights: Vec<&str> = contracts.map(|c| c.right.as_str()).collect();
    vec![
        Column::new("strike".into(), strikes),
        Column::new("right".into(), rights),
    ]
}

fn ohlc_columns(bars: &[&OhlcRow]) -> PolarsResult<Vec<Column>> {
    Ok(vec![
        timestamp_column(bars.iter().map(|b| millis(b.timestamp)).collect())?,
        Column::new("open".into(), bars.iter().map(|b| b.open).collect::<Vec<f64>>()),
        Column::new("high".into(), bars.iter().map(|b| b.high).collect::<Vec<f64>>()),
        Column::new("low".into(), bars.iter().map(|b| b.low).collect::<Vec<f64>>()),
        Column::new("close".into(), bars.iter().map(|b| b.close).collect::<Vec<f64>>()),
        Column::new(
            "volume".into(),
            bars.iter().map(|b| b.volume).collect::<Vec<Option<u64>>>(),
        ),
        quality_column(bars.iter().map(|b| b.quality)),
    ])
}

fn greeks_columns(rows: &[GreeksRow]) -> PolarsResult<Vec<Column>> {
    let field = |name: &str, f: fn(&GreeksRow) -> f64| {
        Column::new(name.into(), rows.iter().map(f).collect::<Vec<f64>>())
    };
    let mut cols = contract_columns(rows.iter().map(|r| &r.contract));
    cols.push(timestamp_column(rows.iter().map(|r| millis(r.timestamp)).collect())?);
    cols.push(field("bid", |r| r.bid));
    cols.push(field("ask", |r| r.ask));
    cols.push(field("delta", |r| r.delta));
    cols.push(field("theta", |r| r.theta));
    cols.push(field("vega", |r| r.vega));
    cols.push(field("rho", |r| r.rho));
    cols.push(field("implied_vol", |r| r.implied_vol));
    cols.push(field("underlying_price", |r| r.underlying_price));
    cols.push(quality_column(rows.iter().map(|r| r.quality)));
    Ok(cols)
}

/// Build the on-disk frame for a partition's rows.
pub fn to_dataframe(rows: &PartitionRows) -> PolarsResult<DataFrame> {
    let columns = match rows {
        PartitionRows::Underlying(bars) => ohlc_columns(&bars.iter().collect::<Vec<_>>())?,
        PartitionRows::OptionOhlc(rows) => {
            let mut cols = contract_columns(rows.iter().map(|r| &r.contract));
            cols.extend(ohlc_columns(&rows.iter().map(|r| &r.bar).collect::<Vec<_>>())?);
            cols
        }
        PartitionRows::Greeks(rows) => greeks_columns(rows)?,
    };
    DataFrame::new(columns)
}

// ── Reading ─────────────────────────────────────────────────────────

fn f64s(df: &DataFrame, name: &str) -> Result<Vec<f64>, String> {
    let ca = df
        .column(name)
        .and_then(|c| c.f64())
        .map_err(|e| format!("{name} column: {e}"))?;
    Ok((0..df.height()).map(|i| ca.get(i).unwrap_or(f64::NAN)).collect())
}

fn strs(df: &DataFrame, name: &str) -> Result<Vec<String>, String> {
    let ca = df
        .column(name)
        .and_then(|c| c.str())
        .map_err(|e| format!("{name} column: {e}"))?;
    (0..df.height())
        .map(|i| {
            ca.get(i)
                .map(str::to_string)
                .ok_or_else(|| format!("null {name} at row {i}"))
        })
        .collect()
}

fn timestamps(df: &DataFrame) -> Result<Vec<NaiveDateTime>, String> {
    let col = df
        .column("timestamp")
        .and_then(|c| c.cast(&DataType::Int64))
        .map_err(|e| format!("timestamp column: {e}"))?;
    let ca = col.i64().map_err(|e| format!("timestamp column type: {e}"))?;
    (0..df.height())
        .map(|i| {
            ca.get(i)
                .and_then(DateTime::from_timestamp_millis)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| format!("null or invalid timestamp at row {i}"))
        })
        .collect()
}

fn volumes(df: &DataFrame) -> Result<Vec<Option<u64>>, String> {
    let col = df
        .column("volume")
        .and_then(|c| c.cast(&DataType::UInt64))
        .map_err(|e| format!("volume column: {e}"))?;
    let ca = col.u64().map_err(|e| format!("volume column type: {e}"))?;
    Ok((0..df.height()).map(|i| ca.get(i)).collect())
}

fn qualities(df: &DataFrame) -> Result<Vec<RowQuality>, String> {
    strs(df, "quality")?.iter().map(|s| s.parse()).collect()
}

fn contracts(df: &DataFrame) -> Result<Vec<Contract>, String> {
    let strikes = f64s(df, "strike")?;
    let rights = strs(df, "right")?;
    strikes
        .into_iter()
        .zip(rights)
        .map(|(strike, right)| {
            Right::parse_terminal(&right)
                .map(|r| Contract::new(strike, r))
                .ok_or_else(|| format!("invalid right '{right}'"))
        })
        .collect()
}

fn read_bars(df: &DataFrame) -> Result<Vec<OhlcRow>, String> {
    let ts = timestamps(df)?;
    let open = f64s(df, "open")?;
    let high = f64s(df, "high")?;
    let low = f64s(df, "low")?;
    let close = f64s(df, "close")?;
    let volume = volumes(df)?;
    let quality = qualities(df)?;
    Ok((0..df.height())
        .map(|i| OhlcRow {
            timestamp: ts[i],
            open: open[i],
            high: high[i],
            low: low[i],
            close: close[i],
            volume: volume[i],
            quality: quality[i],
        })
        .collect())
}

fn read_greeks(df: &DataFrame) -> Result<Vec<GreeksRow>, String> {
    let contracts = contracts(df)?;
    let ts = timestamps(df)?;
    let cols: Vec<Vec<f64>> = [
        "bid",
        "ask",
        "delta",
        "theta",
        "vega",
        "rho",
        "implied_vol",
        "underlying_price",
    ]
    .iter()
    .map(|name| f64s(df, name))
    .collect::<Result<_, _>>()?;
    let quality = qualities(df)?;
    Ok((0..df.height())
        .map(|i| GreeksRow {
            contract: contracts[i],
            timestamp: ts[i],
            bid: cols[0][i],
            ask: cols[1][i],
            delta: cols[2][i],
            theta: cols[3][i],
            vega: cols[4][i],
            rho: cols[5][i],
            implied_vol: cols[6][i],
            underlying_price: cols[7][i],
            quality: quality[i],
        })
        .collect())
}

/// Validate the schema and decode rows of `kind`.
pub fn from_dataframe(df: &DataFrame, kind: DataKind) -> Result<PartitionRows, String> {
    for name in expected_columns(kind) {
        if df.column(name).is_err() {
            return Err(format!("missing column '{name}'"));
        }
    }
    match kind {
        DataKind::UnderlyingOhlc => read_bars(df).map(PartitionRows::Underlying),
        DataKind::OptionOhlc => {
            let contracts = contracts(df)?;
            let bars = read_bars(df)?;
            Ok(PartitionRows::OptionOhlc(
                contracts
                    .into_iter()
                    .zip(bars)
                    .map(|(contract, bar)| OptionOhlcRow { contract, bar })
                    .collect(),
            ))
        }
        DataKind::OptionGreeks => read_greeks(df).map(PartitionRows::Greeks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkUnit;
    use crate::testing::sample_rows;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn frames_carry_expected_columns() {
        for kind in DataKind::ALL {
            let unit = match WorkUnit::option("SPX", d(2), d(5), kind) {
                Some(u) => u,
                None => WorkUnit::underlying("SPX", d(2)),
            };
            let df = to_dataframe(&sample_rows(&unit, 3)).unwrap();
            for col in expected_columns(kind) {
                assert!(df.column(col).is_ok(), "{kind}: missing {col}");
            }
        }
    }

    #[test]
    fn greeks_survive_frame_conversion() {
        let unit = WorkUnit::option("SPX", d(2), d(5), DataKind::OptionGreeks).unwrap();
        let rows = sample_rows(&unit, 2);
        let df = to_dataframe(&rows).unwrap();
        assert_eq!(from_dataframe(&df, DataKind::OptionGreeks).unwrap(), rows);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let unit = WorkUnit::underlying("SPX", d(2));
        let df = to_dataframe(&sample_rows(&unit, 2)).unwrap();
        let err = from_dataframe(&df, DataKind::OptionGreeks).unwrap_err();
        assert!(err.contains("missing column"));
    }
}
