//! Transfer progress accounting for UI events.

use std::time::Instant;

use serde::Serialize;

use crate::transport::TransportKind;

/// Snapshot pushed with every chunk sent or received.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes: u64,
    pub total: u64,
    pub bytes_per_sec: u64,
    pub eta_secs: Option<u64>,
    pub transport: TransportKind,
}

/// Running throughput/ETA tracker for one transfer direction.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    bytes: u64,
    total: u64,
    transport: TransportKind,
}

impl ProgressTracker {
    pub fn new(total: u64, transport: TransportKind) -> Self {
        Self {
            started: Instant::now(),
            bytes: 0,
            total,
            transport,
        }
    }

    /// Account for one chunk and return the updated snapshot.
    pub fn record(&mut self, chunk_bytes: u64) -> TransferProgress {
        self.bytes += chunk_bytes;
        self.snapshot()
    }

    pub fn snapshot(&self) -> TransferProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            (self.bytes as f64 / elapsed) as u64
        } else {
            0
        };
        let remaining = self.total.saturating_sub(self.bytes);
        let eta_secs = if bytes_per_sec > 0 && remaining > 0 {
            Some(remaining.div_ceil(bytes_per_sec))
        } else if remaining == 0 {
            Some(0)
        } else {
            None
        };
        TransferProgress {
            bytes: self.bytes,
            total: self.total,
            bytes_per_sec,
            eta_secs,
            transport: self.transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_accumulates_and_completes() {
        let mut tracker = ProgressTracker::new(1000, TransportKind::Gatt);
        let first = tracker.record(400);
        assert_eq!(first.bytes, 400);
        assert_eq!(first.total, 1000);

        let done = tracker.record(600);
        assert_eq!(done.bytes, 1000);
        assert_eq!(done.eta_secs, Some(0));
        assert_eq!(done.transport, TransportKind::Gatt);
    }

    #[test]
    fn eta_unknown_before_any_throughput() {
        let tracker = ProgressTracker::new(1000, TransportKind::L2cap);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.bytes, 0);
        assert_eq!(snapshot.eta_secs, None);
    }
}
