//! Integration tests for the resilient requester against a scripted
//! transport, checking the audit trail and statistics it leaves behind.

use std::sync::Arc;
use std::time::Duration;
use theta_core::requester::{
    AttemptOutcome, AuditLog, Params, RequestError, RequestStats, ResilientRequester, RetryPolicy,
    TransportError,
};
use theta_core::testing::ScriptedTransport;

const ENDPOINT: &str = "/option/history/ohlc";

fn setup(
    dir: &std::path::Path,
    policy: RetryPolicy,
) -> (Arc<ScriptedTransport>, Arc<RequestStats>, ResilientRequester) {
    let transport = Arc::new(ScriptedTransport::new());
    let audit = Arc::new(AuditLog::open(dir.join("audit.jsonl")).unwrap());
    let stats = Arc::new(RequestStats::new());
    let requester = ResilientRequester::new(
        transport.clone(),
        "http://terminal/v3/",
        policy,
        audit,
        stats.clone(),
    );
    (transport, stats, requester)
}

fn params() -> Params {
    [("symbol", "SPX"), ("date", "20240102")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn exhaustion_after_exactly_three_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, stats, requester) = setup(dir.path(), RetryPolicy::immediate(5));
    transport.always_status(ENDPOINT, 503);

    let err = requester
        .execute(ENDPOINT, &params(), 3, Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, RequestError::Exhausted { attempts: 3, .. }));
    assert_eq!(transport.calls(ENDPOINT), 3);

    let attempts = AuditLog::read_all(&dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::RetryableFailure && a.http_status == Some(503)));
    assert_eq!(attempts[0].params.get("symbol").map(String::as_str), Some("SPX"));

    let snapshot = stats.snapshot();
    let endpoint = &snapshot[ENDPOINT];
    assert_eq!(endpoint.attempts, 3);
    assert_eq!(endpoint.retry_count, 3);
    assert_eq!(endpoint.exhausted_count, 1);
    assert_eq!(endpoint.success_count, 0);
}

#[test]
fn transport_errors_are_retried_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, stats, requester) = setup(dir.path(), RetryPolicy::immediate(3));
    transport.push_error(ENDPOINT, TransportError::Timeout("read timed out".into()));
    transport.push_error(ENDPOINT, TransportError::Connect("refused".into()));
    transport.push_ok(ENDPOINT, "[]");

    let resp = requester.get(ENDPOINT, &params()).unwrap();
    assert_eq!(resp.status, 200);

    let attempts = AuditLog::read_all(&dir.path().join("audit.jsonl")).unwrap();
    let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::RetryableFailure,
            AttemptOutcome::RetryableFailure,
            AttemptOutcome::Success
        ]
    );
    assert_eq!(attempts[0].http_status, None);
    assert!(attempts[0].error.as_deref().unwrap_or("").contains("timed out"));
    assert_eq!(stats.snapshot()[ENDPOINT].success_count, 1);
}

#[test]
fn client_error_stops_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, _stats, requester) = setup(dir.path(), RetryPolicy::immediate(3));
    transport.always_status(ENDPOINT, 404);

    let err = requester.get(ENDPOINT, &params()).unwrap_err();
    assert!(matches!(err, RequestError::Fatal { status: Some(404), .. }));
    assert!(!err.is_transient());
    assert_eq!(transport.calls(ENDPOINT), 1);
    let attempts = AuditLog::read_all(&dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::FatalFailure);
}

#[test]
fn concurrent_requests_share_one_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, stats, requester) = setup(dir.path(), RetryPolicy::immediate(1));
    transport.always_ok(ENDPOINT, "[]");
    let requester = Arc::new(requester);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let requester = requester.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    requester.get(ENDPOINT, &params()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let attempts = AuditLog::read_all(&dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(attempts.len(), 40);
    assert_eq!(stats.snapshot()[ENDPOINT].success_count, 40);
}
