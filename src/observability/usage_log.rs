//! Daily JSONL usage and error records.
//!
//! Files live under `<log_dir>/token_usage/` and `<log_dir>/error_logs/`, one
//! file per local calendar day. Every record is a single `write_all` of one
//! complete line on an append-mode handle, under a mutex, so concurrent
//! requests never interleave partial lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::GatewayError;

const USAGE_DIR: &str = "token_usage";
const ERROR_DIR: &str = "error_logs";

/// Upstream statuses that describe caller or quota conditions.
const CALLER_STATUSES: [u16; 4] = [401, 402, 404, 429];

/// Severity attached to every error record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller or quota condition reported by the upstream.
    Warning,
    Error,
}

/// One completed request's token accounting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub upstream_model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    pub streaming: bool,
    pub estimated: bool,
}

/// One failed request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub request_id: String,
    pub error_kind: String,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub detail: String,
    pub provider: String,
    pub model: String,
    pub streaming: bool,
}

impl ErrorRecord {
    #[must_use]
    pub fn from_error(
        err: &GatewayError,
        request_id: &str,
        provider: &str,
        model: &str,
        streaming: bool,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            request_id: request_id.to_string(),
            error_kind: err.kind().to_string(),
            severity: error_severity(err),
            status: err.upstream_status(),
            detail: err.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            streaming,
        }
    }
}

/// Current local time as an RFC 3339 string.
#[must_use]
pub fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether `err` belongs in the error log. Disconnects are not failures.
#[must_use]
pub fn should_record_error(err: &GatewayError) -> bool {
    !matches!(err, GatewayError::ClientDisconnected)
}

/// Caller and quota rejections are recorded at warning severity.
#[must_use]
pub fn error_severity(err: &GatewayError) -> ErrorSeverity {
    if err
        .upstream_status()
        .is_some_and(|status| CALLER_STATUSES.contains(&status))
    {
        ErrorSeverity::Warning
    } else {
        ErrorSeverity::Error
    }
}

/// Append-only writer for usage and error records.
#[derive(Debug)]
pub struct UsageLog {
    root: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl UsageLog {
    /// `None` disables file logging.
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn record_usage(&self, record: &UsageRecord) {
        self.append(USAGE_DIR, record);
    }

    /// Write an error record unless the client went away.
    pub fn record_error(&self, err: &GatewayError, record: &ErrorRecord) {
        if should_record_error(err) {
            self.append(ERROR_DIR, record);
        }
    }

    fn append<T: Serialize>(&self, subdir: &str, record: &T) {
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize log record");
                return;
            }
        };
        line.push(b'\n');

        let path = daily_file(root, subdir);
        let _guard = self.write_lock.lock();
        if let Err(e) = append_line(&path, &line) {
            warn!(path = %path.display(), error = %e, "failed to write log record");
        }
    }
}

fn daily_file(root: &Path, subdir: &str) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d");
    root.join(subdir).join(format!("{date}.jsonl"))
}

fn append_line(path: &Path, line: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "claude-adapter-{label}-{}-{}",
            std::process::id(),
            fastrand::u64(..)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn usage_record(i: u64) -> UsageRecord {
        UsageRecord {
            timestamp: now_rfc3339(),
            provider: "http://upstream.test/v1".into(),
            model: "claude-sonnet-4".into(),
            upstream_model: "gpt-4o".into(),
            input_tokens: i,
            output_tokens: i * 2,
            cached_input_tokens: None,
            streaming: i % 2 == 0,
            estimated: false,
        }
    }

    fn read_lines(root: &Path, subdir: &str) -> Vec<serde_json::Value> {
        let text = std::fs::read_to_string(daily_file(root, subdir)).unwrap_or_default();
        text.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_concurrent_appends_yield_whole_lines() {
        let root = scratch_dir("usage");
        let log = Arc::new(UsageLog::new(Some(root.clone())));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.record_usage(&usage_record(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = read_lines(&root, USAGE_DIR);
        assert_eq!(lines.len(), 400);
        assert!(lines.iter().all(|line| line["upstream_model"] == "gpt-4o"));
        assert!(lines[0].get("cached_input_tokens").is_none());
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_disconnects_are_not_recorded() {
        let root = scratch_dir("errors-disconnect");
        let log = UsageLog::new(Some(root.clone()));
        let err = GatewayError::ClientDisconnected;
        log.record_error(&err, &ErrorRecord::from_error(&err, "msg_1", "p", "m", true));
        assert!(read_lines(&root, ERROR_DIR).is_empty());
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_caller_statuses_are_recorded_as_warnings() {
        let root = scratch_dir("errors");
        let log = UsageLog::new(Some(root.clone()));
        let errors = [
            GatewayError::UpstreamHttp {
                status: 429,
                message: "slow down".into(),
            },
            GatewayError::UpstreamHttp {
                status: 401,
                message: "bad key".into(),
            },
            GatewayError::UpstreamHttp {
                status: 500,
                message: "boom".into(),
            },
        ];
        for (i, err) in errors.iter().enumerate() {
            let request_id = format!("msg_{i}");
            log.record_error(err, &ErrorRecord::from_error(err, &request_id, "p", "m", false));
        }

        let lines = read_lines(&root, ERROR_DIR);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["status"], 429);
        assert_eq!(lines[0]["severity"], "warning");
        assert_eq!(lines[1]["status"], 401);
        assert_eq!(lines[1]["severity"], "warning");
        assert_eq!(lines[2]["error_kind"], "upstream_http_error");
        assert_eq!(lines[2]["status"], 500);
        assert_eq!(lines[2]["severity"], "error");
        assert_eq!(lines[2]["request_id"], "msg_2");
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = UsageLog::new(None);
        assert!(!log.is_enabled());
        log.record_usage(&usage_record(1));
    }
}
