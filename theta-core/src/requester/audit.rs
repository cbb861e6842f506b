//! Durable audit trail of request attempts.
//!
//! One JSON object per line, append-only. Each record is flushed and synced
//! to disk before the requester moves on, so the trail survives a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// One outbound HTTP attempt. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAttempt {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only JSONL audit log shared by every worker.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one attempt and sync it to disk.
    pub fn record(&self, attempt: &RequestAttempt) -> io::Result<()> {
        let json = serde_json::to_string(attempt)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit log lock poisoned"))?;
        writeln!(file, "{json}")?;
        file.flush()?;
        file.sync_data()
    }

    /// Read every attempt in the log at `path`.
    ///
    /// Malformed lines (a torn final write) are skipped.
    pub fn read_all(path: &Path) -> io::Result<Vec<RequestAttempt>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = io::BufReader::new(File::open(path)?);
        let mut attempts = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RequestAttempt>(&line) {
                Ok(a) => attempts.push(a),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed audit line"),
            }
        }
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(n: u32, outcome: AttemptOutcome) -> RequestAttempt {
        RequestAttempt {
            endpoint: "/option/list/expirations".into(),
            params: BTreeMap::from([("symbol".to_string(), "SPX".to_string())]),
            attempt_number: n,
            timestamp: Utc::now(),
            outcome,
            latency_ms: 3,
            http_status: Some(503),
            error: Some("HTTP 503".into()),
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        {
            let log = AuditLog::open(&path).unwrap();
            log.record(&attempt(1, AttemptOutcome::RetryableFailure)).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        log.record(&attempt(2, AttemptOutcome::Success)).unwrap();

        let all = AuditLog::read_all(&path).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].attempt_number, 1);
        assert_eq!(all[1].outcome, AttemptOutcome::Success);
    }

    #[test]
    fn torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.record(&attempt(1, AttemptOutcome::FatalFailure)).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"endpoint\": \"/opt")
            .unwrap();

        let all = AuditLog::read_all(&path).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AuditLog::read_all(&dir.path().join("none.jsonl"))
            .unwrap()
            .is_empty());
    }
}
