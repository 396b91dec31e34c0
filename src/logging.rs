//! Structured session log with newline-delimited JSON export.
//!
//! The engine records protocol milestones here in addition to the `log`
//! facade; the UI can subscribe to entries via session events and export
//! the whole buffer for diagnostics.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One exported log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event: String,
    pub details: serde_json::Value,
}

/// Bounded in-memory log buffer. Recording never fails the caller; a full
/// buffer drops the oldest entry.
#[derive(Debug)]
pub struct SessionLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SessionLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(
        &self,
        level: LogLevel,
        event: impl Into<String>,
        details: serde_json::Value,
    ) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            event: event.into(),
            details,
        };
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        entry
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newline-delimited JSON, one entry per line, UTF-8.
    pub fn export_ndjson(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            if let Ok(line) = serde_json::to_string(&entry) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    pub fn export_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.export_ndjson())
            .with_context(|| format!("failed to export log to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn export_is_one_json_object_per_line() {
        let log = SessionLog::default();
        log.record(LogLevel::Info, "state_changed", json!({"to": "verifying"}));
        log.record(LogLevel::Warn, "retransmit", json!({"sequence": 3}));

        let exported = log.export_ndjson();
        let lines: Vec<&str> = exported.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert!(value.get("timestamp").is_some());
            assert!(value.get("event").is_some());
        }
    }

    #[test]
    fn buffer_drops_oldest_at_capacity() {
        let log = SessionLog::with_capacity(2);
        log.record(LogLevel::Debug, "one", json!({}));
        log.record(LogLevel::Debug, "two", json!({}));
        log.record(LogLevel::Debug, "three", json!({}));

        let events: Vec<String> = log.entries().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["two", "three"]);
    }

    #[test]
    fn export_to_writes_utf8_file() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("session.ndjson");
        let log = SessionLog::default();
        log.record(LogLevel::Error, "transfer_failed", json!({"message": "boom"}));
        log.export_to(&path).expect("export");

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert!(contents.ends_with('\n'));
        assert!(contents.contains("transfer_failed"));
    }
}
