//! Per-endpoint request counters.

use super::audit::AttemptOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Counters for one endpoint. Every attempt bumps `attempts` and exactly one
/// of `success_count`, `retry_count` or `failure_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub attempts: u64,
    pub success_count: u64,
    pub retry_count: u64,
    pub failure_count: u64,
    /// Calls that ran out of attempts.
    pub exhausted_count: u64,
    /// Attempts whose audit record could not be written.
    pub audit_failures: u64,
    pub total_latency: Duration,
}

impl EndpointStats {
    pub fn mean_latency(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_latency.as_secs_f64() / self.attempts as f64)
    }
}

#[derive(Debug, Serialize)]
struct StatsCsvRow<'a> {
    endpoint: &'a str,
    attempts: u64,
    success_count: u64,
    retry_count: u64,
    failure_count: u64,
    exhausted_count: u64,
    total_latency_ms: u64,
    mean_latency_ms: u64,
    audit_failures: u64,
}

/// Shared, mutex-guarded statistics keyed by endpoint path.
#[derive(Debug, Default)]
pub struct RequestStats {
    inner: Mutex<BTreeMap<String, EndpointStats>>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, endpoint: &str, outcome: AttemptOutcome, latency: Duration) {
        let Ok(mut map) = self.inner.lock() else {
            tracing::error!(endpoint, "request stats lock poisoned; attempt not counted");
            return;
        };
        let entry = map.entry(endpoint.to_string()).or_default();
        entry.attempts += 1;
        entry.total_latency += latency;
        match outcome {
            AttemptOutcome::Success => entry.success_count += 1,
            AttemptOutcome::RetryableFailure => entry.retry_count += 1,
            AttemptOutcome::FatalFailure => entry.failure_count += 1,
        }
    }

    pub fn record_exhausted(&self, endpoint: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.entry(endpoint.to_string()).or_default().exhausted_count += 1;
        }
    }

    pub fn record_audit_failure(&self, endpoint: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.entry(endpoint.to_string()).or_default().audit_failures += 1;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, EndpointStats> {
        self.inner.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Emit one structured log event per endpoint.
    pub fn log_summary(&self) {
        for (endpoint, s) in self.snapshot() {
            tracing::info!(
                endpoint = %endpoint,
                attempts = s.attempts,
                success = s.success_count,
                retry = s.retry_count,
                failure = s.failure_count,
                exhausted = s.exhausted_count,
                audit_failures = s.audit_failures,
                mean_latency_ms = s.mean_latency().as_millis() as u64,
                "request stats"
            );
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_path(path)?;
        for (endpoint, s) in &self.snapshot() {
            wtr.serialize(StatsCsvRow {
                endpoint,
                attempts: s.attempts,
                success_count: s.success_count,
                retry_count: s.retry_count,
                failure_count: s.failure_count,
                exhausted_count: s.exhausted_count,
                total_latency_ms: s.total_latency.as_millis() as u64,
                mean_latency_ms: s.mean_latency().as_millis() as u64,
                audit_failures: s.audit_failures,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn each_attempt_counts_once() {
        let stats = RequestStats::new();
        stats.record("/a", AttemptOutcome::RetryableFailure, Duration::from_millis(10));
        stats.record("/a", AttemptOutcome::Success, Duration::from_millis(30));
        stats.record("/b", AttemptOutcome::FatalFailure, Duration::from_millis(5));

        let snap = stats.snapshot();
        let a = &snap["/a"];
        assert_eq!(a.attempts, 2);
        assert_eq!(a.retry_count + a.success_count + a.failure_count, a.attempts);
        assert_eq!(a.mean_latency(), Duration::from_millis(20));
        assert_eq!(snap["/b"].failure_count, 1);
    }

    #[test]
    fn mean_latency_beyond_u32_attempts() {
        let attempts = 1u64 << 33;
        let s = EndpointStats {
            attempts,
            total_latency: Duration::from_millis(attempts),
            ..EndpointStats::default()
        };
        assert!((s.mean_latency().as_secs_f64() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(RequestStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record("/x", AttemptOutcome::Success, Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot()["/x"].success_count, 800);
    }

    #[test]
    fn csv_has_one_row_per_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        let stats = RequestStats::new();
        stats.record("/a", AttemptOutcome::Success, Duration::from_millis(4));
        stats.record("/b", AttemptOutcome::RetryableFailure, Duration::from_millis(4));
        stats.record_exhausted("/b");
        stats.write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("endpoint,attempts,success_count"));
        assert!(lines[2].starts_with("/b,1,0,1,0,1,"));
    }
}
