//! Resilient request execution: bounded retry, backoff, audit and stats.
//!
//! Every outbound call to the terminal goes through [`ResilientRequester`].
//! Each attempt is classified, recorded to the audit log and counted in
//! [`RequestStats`] before the requester decides to retry or return.

pub mod audit;
pub mod backoff;
pub mod stats;
pub mod transport;

pub use audit::{AttemptOutcome, AuditLog, RequestAttempt};
pub use backoff::RetryPolicy;
pub use stats::{EndpointStats, RequestStats};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Query parameters, ordered so audit records are stable.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("{endpoint}: retryable failure: {message}")]
    Retryable {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{endpoint}: fatal failure (status {status:?}): {message}")]
    Fatal {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{endpoint}: gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{endpoint}: could not decode response: {message}")]
    Decode { endpoint: String, message: String },

    #[error("{endpoint}: no data: {message}")]
    NoData { endpoint: String, message: String },

    /// The attempt could not be written to the audit log. The response, if
    /// any, is discarded.
    #[error("{endpoint}: audit log {path} not writable: {message}")]
    Audit {
        endpoint: String,
        path: String,
        message: String,
    },
}

impl RequestError {
    pub fn endpoint(&self) -> &str {
        match self {
            RequestError::Retryable { endpoint, .. }
            | RequestError::Fatal { endpoint, .. }
            | RequestError::Exhausted { endpoint, .. }
            | RequestError::Decode { endpoint, .. }
            | RequestError::NoData { endpoint, .. }
            | RequestError::Audit { endpoint, .. } => endpoint,
        }
    }

    /// Whether trying the whole call again later could help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestError::Retryable { .. } | RequestError::Exhausted { .. }
        )
    }
}

/// Executes GET requests against the terminal with retry and bookkeeping.
pub struct ResilientRequester {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    policy: RetryPolicy,
    audit: Arc<AuditLog>,
    stats: Arc<RequestStats>,
}

impl ResilientRequester {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        policy: RetryPolicy,
        audit: Arc<AuditLog>,
        stats: Arc<RequestStats>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
            audit,
            stats,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &Arc<RequestStats> {
        &self.stats
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `execute` with the configured attempt budget and base delay.
    pub fn get(&self, endpoint: &str, params: &Params) -> Result<HttpResponse, RequestError> {
        self.execute(
            endpoint,
            params,
            self.policy.max_attempts,
            self.policy.base_delay(),
        )
    }

    /// Run one logical request with up to `max_attempts` attempts.
    ///
    /// Returns the first 2xx response. A fatal classification returns
    /// immediately; retryable failures back off and try again until the
    /// budget is spent. An attempt that cannot be audited ends the call with
    /// [`RequestError::Audit`], whatever the terminal answered.
    pub fn execute(
        &self,
        endpoint: &str,
        params: &Params,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<HttpResponse, RequestError> {
        let policy = self.policy.with_limits(max_attempts, base_delay);
        let url = format!("{}{}", self.base_url, endpoint);
        let query: Vec<(String, String)> =
            params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                let delay = policy.next_delay(attempt - 1);
                tracing::debug!(endpoint, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                std::thread::sleep(delay);
            }

            let started = Instant::now();
            let result = self.transport.get(&url, &query);
            let latency = started.elapsed();
            let classified = classify(endpoint, result);

            let record = RequestAttempt {
                endpoint: endpoint.to_string(),
                params: params.clone(),
                attempt_number: attempt,
                timestamp: Utc::now(),
                outcome: classified.outcome(),
                latency_ms: latency.as_millis() as u64,
                http_status: classified.status(),
                error: classified.error_message(),
            };
            let audited = self.audit.record(&record);
            self.stats.record(endpoint, record.outcome, latency);
            if let Err(e) = audited {
                self.stats.record_audit_failure(endpoint);
                tracing::error!(
                    endpoint,
                    attempt,
                    path = %self.audit.path().display(),
                    error = %e,
                    "failed to append audit record"
                );
                return Err(RequestError::Audit {
                    endpoint: endpoint.to_string(),
                    path: self.audit.path().display().to_string(),
                    message: e.to_string(),
                });
            }

            match classified {
                Classified::Success(resp) => return Ok(resp),
                Classified::Fatal(err) => {
                    tracing::warn!(endpoint, attempt, error = %err, "fatal request failure");
                    return Err(err);
                }
                Classified::Retryable(err) => {
                    tracing::warn!(endpoint, attempt, max_attempts = policy.max_attempts, error = %err, "retryable request failure");
                    last_error = err.to_string();
                }
            }
        }

        self.stats.record_exhausted(endpoint);
        Err(RequestError::Exhausted {
            endpoint: endpoint.to_string(),
            attempts: policy.max_attempts,
            last_error,
        })
    }
}

enum Classified {
    Success(HttpResponse),
    Retryable(RequestError),
    Fatal(RequestError),
}

impl Classified {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Classified::Success(_) => AttemptOutcome::Success,
            Classified::Retryable(_) => AttemptOutcome::RetryableFailure,
            Classified::Fatal(_) => AttemptOutcome::FatalFailure,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Classified::Success(resp) => Some(resp.status),
            Classified::Retryable(RequestError::Retryable { status, .. })
            | Classified::Fatal(RequestError::Fatal { status, .. }) => *status,
            _ => None,
        }
    }

    fn error_message(&self) -> Option<String> {
        match self {
            Classified::Success(_) => None,
            Classified::Retryable(e) | Classified::Fatal(e) => Some(e.to_string()),
        }
    }
}

/// 2xx succeeds; timeouts, connection failures, 5xx and 429 are retryable;
/// any other status or a malformed request is fatal.
fn classify(endpoint: &str, result: Result<HttpResponse, TransportError>) -> Classified {
    match result {
        Ok(resp) if resp.is_success() => Classified::Success(resp),
        Ok(resp) => {
            let message = format!("HTTP {}: {}", resp.status, snippet(&resp.body));
            if resp.status == 429 || resp.status >= 500 {
                Classified::Retryable(RequestError::Retryable {
                    endpoint: endpoint.to_string(),
                    status: Some(resp.status),
                    message,
                })
            } else {
                Classified::Fatal(RequestError::Fatal {
                    endpoint: endpoint.to_string(),
                    status: Some(resp.status),
                    message,
                })
            }
        }
        Err(e) if e.is_retryable() => Classified::Retryable(RequestError::Retryable {
            endpoint: endpoint.to_string(),
            status: None,
            message: e.to_string(),
        }),
        Err(e) => Classified::Fatal(RequestError::Fatal {
            endpoint: endpoint.to_string(),
            status: None,
            message: e.to_string(),
        }),
    }
}

fn snippet(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn requester(transport: Arc<ScriptedTransport>, dir: &std::path::Path) -> ResilientRequester {
        ResilientRequester::new(
            transport,
            "http://terminal/v3/",
            RetryPolicy::immediate(3),
            Arc::new(AuditLog::open(dir.join("audit.jsonl")).unwrap()),
            Arc::new(RequestStats::new()),
        )
    }

    fn params() -> Params {
        Params::from([("symbol".to_string(), "SPX".to_string())])
    }

    #[test]
    fn classification_table() {
        let cases = [
            (200, AttemptOutcome::Success),
            (429, AttemptOutcome::RetryableFailure),
            (500, AttemptOutcome::RetryableFailure),
            (503, AttemptOutcome::RetryableFailure),
            (400, AttemptOutcome::FatalFailure),
            (404, AttemptOutcome::FatalFailure),
            (472, AttemptOutcome::FatalFailure),
        ];
        for (status, expected) in cases {
            let c = classify("/x", Ok(HttpResponse::new(status, "")));
            assert_eq!(c.outcome(), expected, "status {status}");
        }
        let timeout = classify("/x", Err(TransportError::Timeout("slow".into())));
        assert_eq!(timeout.outcome(), AttemptOutcome::RetryableFailure);
        let bad = classify("/x", Err(TransportError::InvalidRequest("bad".into())));
        assert_eq!(bad.outcome(), AttemptOutcome::FatalFailure);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status("/option/list/expirations", 503);
        transport.push_error("/option/list/expirations", TransportError::Timeout("t".into()));
        transport.push_ok("/option/list/expirations", r#"{"response": []}"#);

        let req = requester(Arc::clone(&transport), dir.path());
        let resp = req.get("/option/list/expirations", &params()).unwrap();
        assert_eq!(resp.status, 200);

        let audit = AuditLog::read_all(&dir.path().join("audit.jsonl")).unwrap();
        let outcomes: Vec<_> = audit.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::RetryableFailure,
                AttemptOutcome::RetryableFailure,
                AttemptOutcome::Success
            ]
        );
        assert_eq!(audit[0].http_status, Some(503));
        assert_eq!(audit[1].http_status, None);

        let stats = req.stats().snapshot();
        let s = &stats["/option/list/expirations"];
        assert_eq!((s.attempts, s.retry_count, s.success_count), (3, 2, 1));
        assert_eq!(s.exhausted_count, 0);
    }

    #[test]
    fn fatal_status_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status("/stock/history/ohlc", 404);
        transport.push_ok("/stock/history/ohlc", "{}");

        let req = requester(Arc::clone(&transport), dir.path());
        let err = req.get("/stock/history/ohlc", &params()).unwrap_err();
        assert!(matches!(err, RequestError::Fatal { status: Some(404), .. }));
        assert_eq!(transport.calls("/stock/history/ohlc"), 1);
        assert!(!err.is_transient());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unwritable_audit_log_fails_the_request() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok("/option/list/expirations", r#"{"response": []}"#);
        transport.push_ok("/option/list/expirations", r#"{"response": []}"#);

        // every write to /dev/full fails with ENOSPC
        let req = ResilientRequester::new(
            transport.clone(),
            "http://terminal/v3",
            RetryPolicy::immediate(3),
            Arc::new(AuditLog::open("/dev/full").unwrap()),
            Arc::new(RequestStats::new()),
        );
        let err = req.get("/option/list/expirations", &params()).unwrap_err();
        assert!(matches!(err, RequestError::Audit { .. }));
        assert!(!err.is_transient());
        assert_eq!(transport.calls("/option/list/expirations"), 1);

        let stats = req.stats().snapshot();
        let s = &stats["/option/list/expirations"];
        assert_eq!((s.attempts, s.success_count, s.audit_failures), (1, 1, 1));
    }

    #[test]
    fn urls_join_without_double_slash() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok("/calendar/year_holidays", "[]");
        let req = requester(Arc::clone(&transport), dir.path());
        req.get("/calendar/year_holidays", &Params::new()).unwrap();
        assert_eq!(
            transport.urls(),
            vec!["http://terminal/v3/calendar/year_holidays".to_string()]
        );
    }
}
