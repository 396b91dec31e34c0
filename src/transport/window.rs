//! Sliding-window bookkeeping for bulk data frames in flight over the
//! GATT path.
//!
//! Cumulative ACKs retire everything at or below the acknowledged
//! sequence; the 64-bit NACK bitmap names selectively missing sequences
//! starting at `cumulative + 1`; a timeout sweep recovers from lost ACKs.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::protocol::AckPayload;

#[derive(Debug, Clone)]
struct Inflight {
    encoded: Vec<u8>,
    sent_at: Instant,
    retry_count: u32,
}

#[derive(Debug)]
pub struct SlidingWindow {
    window_size: usize,
    inflight: BTreeMap<u64, Inflight>,
}

impl SlidingWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            inflight: BTreeMap::new(),
        }
    }

    /// A sequence may be sent when it is already tracked (idempotent
    /// resend) or when a window slot is free.
    pub fn can_send(&self, sequence: u64) -> bool {
        self.inflight.contains_key(&sequence) || self.inflight.len() < self.window_size
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Insert or refresh the tracking entry for a sent envelope.
    pub fn mark_sent(&mut self, sequence: u64, encoded: Vec<u8>, now: Instant) {
        let entry = self.inflight.entry(sequence).or_insert(Inflight {
            encoded: Vec::new(),
            sent_at: now,
            retry_count: 0,
        });
        entry.encoded = encoded;
        entry.sent_at = now;
    }

    /// Apply a cumulative ACK + NACK bitmap. Returns the sequences the
    /// peer selectively reported missing and that are still tracked,
    /// ascending, each with its stored envelope for retransmission.
    pub fn process_ack(&mut self, ack: &AckPayload) -> Vec<(u64, Vec<u8>)> {
        self.inflight = self.inflight.split_off(&(ack.cumulative + 1));

        let mut candidates = Vec::new();
        for bit in 0..64u32 {
            if ack.nack_bitmap & (1u64 << bit) == 0 {
                continue;
            }
            let sequence = ack.cumulative + 1 + u64::from(bit);
            if let Some(entry) = self.inflight.get(&sequence) {
                candidates.push((sequence, entry.encoded.clone()));
            }
        }
        candidates
    }

    /// Every tracked sequence whose last transmission is at least
    /// `timeout` old, ascending.
    pub fn timed_out_sequences(&self, now: Instant, timeout: Duration) -> Vec<(u64, Vec<u8>)> {
        self.inflight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= timeout)
            .map(|(sequence, entry)| (*sequence, entry.encoded.clone()))
            .collect()
    }

    /// Refresh the send timestamp and bump the retry counter. Returns the
    /// new retry count, or `None` when the sequence is no longer tracked.
    pub fn mark_retransmitted(&mut self, sequence: u64, now: Instant) -> Option<u32> {
        let entry = self.inflight.get_mut(&sequence)?;
        entry.sent_at = now;
        entry.retry_count += 1;
        Some(entry.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(seqs: &[u64], now: Instant) -> SlidingWindow {
        let mut window = SlidingWindow::new(seqs.len().max(1));
        for &seq in seqs {
            window.mark_sent(seq, vec![seq as u8], now);
        }
        window
    }

    #[test]
    fn admission_respects_window_size() {
        let now = Instant::now();
        let mut window = SlidingWindow::new(2);
        assert!(window.can_send(0));
        window.mark_sent(0, vec![0], now);
        assert!(window.can_send(1));
        window.mark_sent(1, vec![1], now);
        assert!(!window.can_send(2));
        // already inflight → idempotent resend allowed
        assert!(window.can_send(1));
    }

    #[test]
    fn cumulative_ack_retires_covered_sequences() {
        let now = Instant::now();
        let mut window = SlidingWindow::new(3);
        for seq in 0..3 {
            window.mark_sent(seq, vec![seq as u8], now);
        }
        assert!(!window.can_send(3));

        let retransmits = window.process_ack(&AckPayload {
            cumulative: 1,
            nack_bitmap: 0,
        });
        assert!(retransmits.is_empty());
        assert_eq!(window.inflight_len(), 1);
        assert!(window.can_send(3));
    }

    #[test]
    fn nack_bitmap_names_missing_sequences() {
        let now = Instant::now();
        let mut window = window_with(&[10, 11, 12, 13, 14], now);
        let retransmits = window.process_ack(&AckPayload {
            cumulative: 10,
            nack_bitmap: 0b101,
        });
        let sequences: Vec<u64> = retransmits.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![11, 13]);
    }

    #[test]
    fn nack_for_unknown_sequence_is_ignored() {
        let now = Instant::now();
        let mut window = window_with(&[5], now);
        let retransmits = window.process_ack(&AckPayload {
            cumulative: 4,
            nack_bitmap: 0b10, // sequence 6, never sent
        });
        assert!(retransmits.is_empty());
    }

    #[test]
    fn timeout_returns_stale_entries_only() {
        let now = Instant::now();
        let timeout = Duration::from_millis(200);
        let mut window = SlidingWindow::new(4);
        window.mark_sent(0, vec![0], now);
        window.mark_sent(1, vec![1], now + Duration::from_millis(150));

        let stale = window.timed_out_sequences(now + timeout, timeout);
        let sequences: Vec<u64> = stale.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![0]);
    }

    #[test]
    fn retransmit_refreshes_timestamp_and_counts() {
        let now = Instant::now();
        let timeout = Duration::from_millis(100);
        let mut window = window_with(&[3], now);

        assert_eq!(window.mark_retransmitted(3, now + timeout), Some(1));
        assert!(window
            .timed_out_sequences(now + timeout, timeout)
            .is_empty());
        assert_eq!(window.mark_retransmitted(3, now + timeout), Some(2));
        assert_eq!(window.mark_retransmitted(99, now), None);
    }
}
