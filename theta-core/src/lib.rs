//! Theta Core: terminal client, resilient requester, trading calendar,
//! partition store and corrector.
//!
//! This crate holds everything that touches one unit of data:
//! - Domain types (work units, OHLC and greeks rows, row quality flags)
//! - Trading calendar and the closed per-symbol expiration policy table
//! - Resilient requester: bounded retries with jittered backoff, JSONL audit
//!   log, per-endpoint statistics
//! - Terminal client decoding the v3 REST surface, with the spot-proxy
//!   fallback for roots that have no direct underlying history
//! - Parquet partition store with atomic writes and integrity sidecars
//! - Corrector for degenerate rows and short gaps

pub mod calendar;
pub mod client;
pub mod corrector;
pub mod domain;
pub mod requester;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything the worker pool shares or moves
    /// between threads is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain
        require_send::<domain::WorkUnit>();
        require_sync::<domain::WorkUnit>();
        require_send::<domain::PartitionData>();
        require_sync::<domain::PartitionData>();

        // Calendar
        require_send::<calendar::TradingCalendar>();
        require_sync::<calendar::TradingCalendar>();

        // Requester
        require_send::<requester::ResilientRequester>();
        require_sync::<requester::ResilientRequester>();
        require_send::<requester::AuditLog>();
        require_sync::<requester::AuditLog>();
        require_send::<requester::RequestStats>();
        require_sync::<requester::RequestStats>();
        require_send::<requester::RequestError>();
        require_sync::<requester::RequestError>();

        // Client
        require_send::<client::ThetaClient>();
        require_sync::<client::ThetaClient>();

        // Store and corrector
        require_send::<store::PartitionStore>();
        require_sync::<store::PartitionStore>();
        require_send::<store::PersistError>();
        require_sync::<store::PersistError>();
        require_send::<corrector::Corrector>();
        require_sync::<corrector::Corrector>();
        require_send::<corrector::ReportSet>();
        require_sync::<corrector::ReportSet>();
    }

    /// The engine holds sources behind `Arc<dyn TerminalSource>`.
    #[test]
    fn terminal_source_is_object_safe() {
        fn _check(source: std::sync::Arc<dyn client::TerminalSource>) -> String {
            source.name().to_string()
        }
        let source: std::sync::Arc<dyn client::TerminalSource> =
            std::sync::Arc::new(testing::StaticSource::synthetic(1));
        assert_eq!(_check(source), "static");
    }
}
