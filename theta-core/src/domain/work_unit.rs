//! WorkUnit: the smallest independently fetchable and persistable piece of work.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which dataset a work unit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    OptionOhlc,
    OptionGreeks,
    UnderlyingOhlc,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [
        DataKind::OptionOhlc,
        DataKind::OptionGreeks,
        DataKind::UnderlyingOhlc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::OptionOhlc => "option_ohlc",
            DataKind::OptionGreeks => "option_greeks",
            DataKind::UnderlyingOhlc => "underlying_ohlc",
        }
    }

    /// Option kinds are keyed by an expiration; the underlying kind is not.
    pub fn is_option(self) -> bool {
        !matches!(self, DataKind::UnderlyingOhlc)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown data kind '{s}'"))
    }
}

/// One (symbol, trade date, expiration, kind) tuple.
///
/// Identity is the full tuple: two units with equal fields always map to the
/// same partition path. Fields are private so a unit cannot be mutated after
/// construction; option units always carry an expiration and underlying units
/// never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    symbol: String,
    trade_date: NaiveDate,
    expiration: Option<NaiveDate>,
    kind: DataKind,
}

impl WorkUnit {
    /// An option unit (`OptionOhlc` or `OptionGreeks`) for one expiration.
    ///
    /// Returns `None` if `kind` is not an option kind.
    pub fn option(
        symbol: impl Into<String>,
        trade_date: NaiveDate,
        expiration: NaiveDate,
        kind: DataKind,
    ) -> Option<Self> {
        if !kind.is_option() {
            return None;
        }
        Some(Self {
            symbol: symbol.into(),
            trade_date,
            expiration: Some(expiration),
            kind,
        })
    }

    /// The underlying OHLC unit for a symbol on a trade date.
    pub fn underlying(symbol: impl Into<String>, trade_date: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            trade_date,
            expiration: None,
            kind: DataKind::UnderlyingOhlc,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn trade_date(&self) -> NaiveDate {
        self.trade_date
    }

    pub fn expiration(&self) -> Option<NaiveDate> {
        self.expiration
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expiration {
            Some(exp) => write!(
                f,
                "{}/{}/{}/exp={}",
                self.symbol,
                self.kind,
                self.trade_date.format("%Y%m%d"),
                exp.format("%Y%m%d")
            ),
            None => write!(
                f,
                "{}/{}/{}",
                self.symbol,
                self.kind,
                self.trade_date.format("%Y%m%d")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn option_constructor_rejects_underlying_kind() {
        assert!(WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 2), DataKind::UnderlyingOhlc)
            .is_none());
        let unit =
            WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 5), DataKind::OptionGreeks).unwrap();
        assert_eq!(unit.expiration(), Some(d(2024, 1, 5)));
        assert_eq!(unit.kind(), DataKind::OptionGreeks);
    }

    #[test]
    fn underlying_unit_has_no_expiration() {
        let unit = WorkUnit::underlying("SPY", d(2024, 1, 2));
        assert_eq!(unit.expiration(), None);
        assert_eq!(unit.kind(), DataKind::UnderlyingOhlc);
    }

    #[test]
    fn identity_is_the_full_tuple() {
        let a = WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 5), DataKind::OptionOhlc);
        let b = WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 5), DataKind::OptionOhlc);
        let c = WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 5), DataKind::OptionGreeks);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn data_kind_parses_its_own_name() {
        for kind in DataKind::ALL {
            assert_eq!(kind.as_str().parse::<DataKind>().unwrap(), kind);
        }
        assert!("ohlc".parse::<DataKind>().is_err());
    }

    #[test]
    fn display_is_stable() {
        let unit =
            WorkUnit::option("SPX", d(2024, 1, 2), d(2024, 1, 5), DataKind::OptionOhlc).unwrap();
        assert_eq!(unit.to_string(), "SPX/option_ohlc/20240102/exp=20240105");
        assert_eq!(
            WorkUnit::underlying("SPX", d(2024, 1, 2)).to_string(),
            "SPX/underlying_ohlc/20240102"
        );
    }
}
