//! Per-symbol policy: which expiration rule applies and where the
//! underlying's OHLC comes from.

/// Expiration-selection family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolClass {
    /// 0DTE plus next week's last trading day.
    Standard,
    /// Wednesday-settled volatility products.
    VixFamily,
}

/// Endpoint family that serves a symbol's underlying bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnderlyingSource {
    Index,
    Stock,
    /// No direct OHLC on the terminal; reconstruct spot from option greeks.
    SpotProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPolicy {
    pub class: SymbolClass,
    pub underlying_source: UnderlyingSource,
    /// Root symbol the underlying is quoted under, when it differs from the
    /// option root (SPXW options settle on SPX).
    pub underlying_root: Option<&'static str>,
}

const fn policy(
    class: SymbolClass,
    underlying_source: UnderlyingSource,
    underlying_root: Option<&'static str>,
) -> SymbolPolicy {
    SymbolPolicy {
        class,
        underlying_source,
        underlying_root,
    }
}

const DEFAULT_POLICY: SymbolPolicy = policy(SymbolClass::Standard, UnderlyingSource::Stock, None);

const POLICIES: &[(&str, SymbolPolicy)] = &[
    ("SPX", policy(SymbolClass::Standard, UnderlyingSource::Index, None)),
    ("SPXW", policy(SymbolClass::Standard, UnderlyingSource::Index, Some("SPX"))),
    ("NDX", policy(SymbolClass::Standard, UnderlyingSource::Index, None)),
    ("NDXP", policy(SymbolClass::Standard, UnderlyingSource::Index, Some("NDX"))),
    ("RUT", policy(SymbolClass::Standard, UnderlyingSource::Index, None)),
    ("XSP", policy(SymbolClass::Standard, UnderlyingSource::SpotProxy, None)),
    ("VIX", policy(SymbolClass::VixFamily, UnderlyingSource::Index, None)),
    ("VIXW", policy(SymbolClass::VixFamily, UnderlyingSource::Index, Some("VIX"))),
];

/// Look up a symbol's policy. Unlisted symbols are treated as standard
/// equity/ETF options with stock-endpoint underlyings.
pub fn policy_for(symbol: &str) -> SymbolPolicy {
    let upper = symbol.trim().to_ascii_uppercase();
    POLICIES
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_POLICY)
}

impl SymbolPolicy {
    /// The symbol to request underlying bars for.
    pub fn underlying_symbol(&self, symbol: &str) -> String {
        match self.underlying_root {
            Some(root) => root.to_string(),
            None => symbol.trim().to_ascii_uppercase(),
        }
    }
}
