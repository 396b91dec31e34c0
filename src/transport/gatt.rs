//! Reliable frame delivery over MTU-bounded, unacknowledged GATT writes.
//!
//! Envelopes are fragmented into `GD` packets, reassembled by frame id on
//! the far side, and bulk data frames ride a sliding window with
//! cumulative/selective ACKs plus a retry timer for lost packets and lost
//! ACKs. Control frames use write-with-response and need none of that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::protocol::{self, Frame};
use crate::transport::window::SlidingWindow;
use crate::transport::{FrameTransport, PacketLink, TransportError, TransportKind};

pub const PACKET_MAGIC: [u8; 2] = *b"GD";
pub const PACKET_HEADER_LEN: usize = 11;
pub const FLAG_BULK: u8 = 0x00;
pub const FLAG_CONTROL: u8 = 0x01;

/// Smallest MTU the fragmenter will work with.
const MIN_PACKET_SIZE: usize = 40;

/// Reassembly entries untouched this long are dropped.
const REASSEMBLY_TTL: Duration = Duration::from_secs(10);

const INCOMING_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Packet header
// ---------------------------------------------------------------------------

/// Fixed 11-byte packet header (big-endian):
/// ```text
/// [0..2]   magic "GD"
/// [2..6]   frame id (u32, wraps skipping 0)
/// [6..8]   fragment index (u16)
/// [8..10]  fragment count (u16)
/// [10]     flags — 0x00 bulk, 0x01 control
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub flags: u8,
}

impl PacketHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PACKET_HEADER_LEN);
        buf[0..2].copy_from_slice(&PACKET_MAGIC);
        buf[2..6].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[8..10].copy_from_slice(&self.fragment_count.to_be_bytes());
        buf[10] = self.flags;
    }

    /// Returns `None` on short buffers or bad magic.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_LEN || buf[0..2] != PACKET_MAGIC {
            return None;
        }
        Some(Self {
            frame_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            fragment_index: u16::from_be_bytes([buf[6], buf[7]]),
            fragment_count: u16::from_be_bytes([buf[8], buf[9]]),
            flags: buf[10],
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GattConfig {
    pub window_size: usize,
    /// Cadence of the retransmission sweep.
    pub retry_interval: Duration,
    /// Age at which an unacknowledged bulk frame is retransmitted.
    pub retry_timeout: Duration,
    /// Retransmissions per sequence before the stream fails.
    pub max_retries: u32,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            retry_interval: Duration::from_millis(200),
            retry_timeout: Duration::from_secs(2),
            max_retries: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

struct Shared {
    link: Arc<dyn PacketLink>,
    window: Mutex<SlidingWindow>,
    /// Woken whenever an ACK frees window slots.
    slots: Notify,
    frame_ids: AtomicU32,
    /// Per-fragment payload bytes: the link's packet size, clamped to at
    /// least 40, minus the header.
    fragment_capacity: usize,
    config: GattConfig,
}

impl Shared {
    /// Monotonic u32 frame id, wrapping and skipping 0. A pure reassembly
    /// key on the receiver, never a sequence number.
    fn next_frame_id(&self) -> u32 {
        loop {
            let id = self.frame_ids.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

pub struct GattTransport {
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::Receiver<Result<Frame, TransportError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl GattTransport {
    /// Wrap a packet link and start the receive and retry tasks.
    pub fn start(link: Arc<dyn PacketLink>, config: GattConfig) -> Self {
        let fragment_capacity = link.max_packet_size().max(MIN_PACKET_SIZE) - PACKET_HEADER_LEN;
        let shared = Arc::new(Shared {
            link,
            window: Mutex::new(SlidingWindow::new(config.window_size)),
            slots: Notify::new(),
            frame_ids: AtomicU32::new(1),
            fragment_capacity,
            config,
        });
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);

        let reader = tokio::spawn(receive_loop(shared.clone(), tx.clone()));
        let retrier = tokio::spawn(retry_loop(shared.clone(), tx));

        Self {
            shared,
            incoming: Mutex::new(rx),
            tasks: vec![reader, retrier],
        }
    }
}

#[async_trait]
impl FrameTransport for GattTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Gatt
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let envelope =
            protocol::encode(&frame).map_err(|err| TransportError::Io(err.to_string()))?;

        if let Frame::Data(data) = &frame {
            // Admission: wait for a window slot unless this sequence is
            // already inflight.
            loop {
                let notified = self.shared.slots.notified();
                if self.shared.window.lock().await.can_send(data.sequence) {
                    break;
                }
                notified.await;
            }
            let frame_id = self.shared.next_frame_id();
            send_fragments(&self.shared, frame_id, &envelope, FLAG_BULK).await?;
            self.shared
                .window
                .lock()
                .await
                .mark_sent(data.sequence, envelope, Instant::now());
        } else {
            let frame_id = self.shared.next_frame_id();
            send_fragments(&self.shared, frame_id, &envelope, FLAG_CONTROL).await?;
        }
        Ok(())
    }

    async fn next_frame(&self) -> Result<Frame, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for GattTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

fn fragment(frame_id: u32, envelope: &[u8], capacity: usize, flags: u8) -> Vec<Vec<u8>> {
    let count = envelope.len().div_ceil(capacity).max(1);
    let mut packets = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * capacity;
        let end = (start + capacity).min(envelope.len());
        let mut packet = vec![0u8; PACKET_HEADER_LEN + (end - start)];
        PacketHeader {
            frame_id,
            fragment_index: index as u16,
            fragment_count: count as u16,
            flags,
        }
        .write_to(&mut packet);
        packet[PACKET_HEADER_LEN..].copy_from_slice(&envelope[start..end]);
        packets.push(packet);
    }
    packets
}

async fn send_fragments(
    shared: &Shared,
    frame_id: u32,
    envelope: &[u8],
    flags: u8,
) -> Result<(), TransportError> {
    for packet in fragment(frame_id, envelope, shared.fragment_capacity, flags) {
        if flags == FLAG_BULK {
            if !shared.link.can_send_without_response() {
                shared.link.wait_write_ready().await?;
            }
            shared.link.write_packet(&packet, false).await?;
        } else {
            shared.link.write_packet(&packet, true).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reassembly + receive loop
// ---------------------------------------------------------------------------

struct Reassembly {
    fragment_count: u16,
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    updated_at: Instant,
}

impl Reassembly {
    fn new(fragment_count: u16, now: Instant) -> Self {
        Self {
            fragment_count,
            fragments: vec![None; fragment_count as usize],
            received: 0,
            updated_at: now,
        }
    }

    fn insert(&mut self, index: u16, payload: &[u8], now: Instant) -> bool {
        if index >= self.fragment_count {
            return false;
        }
        let slot = &mut self.fragments[index as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            self.received += 1;
        }
        self.updated_at = now;
        self.received == self.fragment_count
    }

    fn assemble(self) -> Vec<u8> {
        let mut envelope = Vec::new();
        for fragment in self.fragments.into_iter().flatten() {
            envelope.extend_from_slice(&fragment);
        }
        envelope
    }
}

async fn receive_loop(shared: Arc<Shared>, tx: mpsc::Sender<Result<Frame, TransportError>>) {
    let mut pending: HashMap<u32, Reassembly> = HashMap::new();

    loop {
        let Some(packet) = shared.link.next_packet().await else {
            let _ = tx.send(Err(TransportError::Closed)).await;
            return;
        };
        let now = Instant::now();
        pending.retain(|_, entry| now.duration_since(entry.updated_at) < REASSEMBLY_TTL);

        let Some(header) = PacketHeader::parse(&packet) else {
            log::debug!("dropping unparseable {}-byte packet", packet.len());
            continue;
        };
        if header.fragment_count == 0 {
            continue;
        }

        let entry = pending
            .entry(header.frame_id)
            .or_insert_with(|| Reassembly::new(header.fragment_count, now));
        if entry.fragment_count != header.fragment_count {
            // Conflicting split for the same id — start over with the new one.
            *entry = Reassembly::new(header.fragment_count, now);
        }
        if !entry.insert(header.fragment_index, &packet[PACKET_HEADER_LEN..], now) {
            continue;
        }

        let envelope = pending
            .remove(&header.frame_id)
            .map(Reassembly::assemble)
            .unwrap_or_default();
        let frame = match protocol::decode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Err(TransportError::Io(err.to_string()))).await;
                return;
            }
        };

        if let Frame::Ack(ack) = &frame {
            let retransmits = {
                let mut window = shared.window.lock().await;
                let retransmits = window.process_ack(ack);
                for (sequence, _) in &retransmits {
                    window.mark_retransmitted(*sequence, now);
                }
                retransmits
            };
            shared.slots.notify_one();
            for (sequence, envelope) in retransmits {
                log::debug!("nack retransmit of sequence {sequence}");
                let frame_id = shared.next_frame_id();
                if let Err(err) = send_fragments(&shared, frame_id, &envelope, FLAG_BULK).await {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }

        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

async fn retry_loop(shared: Arc<Shared>, tx: mpsc::Sender<Result<Frame, TransportError>>) {
    let mut tick = tokio::time::interval(shared.config.retry_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        let now = Instant::now();
        let stale = {
            let window = shared.window.lock().await;
            window.timed_out_sequences(now, shared.config.retry_timeout)
        };
        for (sequence, envelope) in stale {
            let retry_count = {
                let mut window = shared.window.lock().await;
                window.mark_retransmitted(sequence, now)
            };
            let Some(retry_count) = retry_count else {
                continue; // acknowledged in the meantime
            };
            if retry_count > shared.config.max_retries {
                log::warn!("sequence {sequence} exhausted {retry_count} retransmissions");
                let _ = tx.send(Err(TransportError::Timeout("gatt retransmit"))).await;
                return;
            }
            log::debug!("timeout retransmit of sequence {sequence} (attempt {retry_count})");
            let frame_id = shared.next_frame_id();
            if let Err(err) = send_fragments(&shared, frame_id, &envelope, FLAG_BULK).await {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckPayload, DataPayload};
    use crate::transport::LoopbackLink;

    fn test_config() -> GattConfig {
        GattConfig {
            window_size: 4,
            retry_interval: Duration::from_millis(20),
            retry_timeout: Duration::from_millis(100),
            max_retries: 5,
        }
    }

    #[test]
    fn packet_header_roundtrip() {
        let header = PacketHeader {
            frame_id: 0xDEADBEEF,
            fragment_index: 3,
            fragment_count: 9,
            flags: FLAG_CONTROL,
        };
        let mut buf = [0u8; PACKET_HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(PacketHeader::parse(&buf), Some(header));
    }

    #[test]
    fn parse_rejects_bad_magic_and_short_buffers() {
        assert_eq!(PacketHeader::parse(&[0u8; PACKET_HEADER_LEN]), None);
        assert_eq!(PacketHeader::parse(b"GD"), None);
    }

    #[test]
    fn fragmentation_splits_and_preserves_order() {
        let envelope: Vec<u8> = (0..100u8).collect();
        let packets = fragment(7, &envelope, 37, FLAG_BULK);
        assert_eq!(packets.len(), 3);

        let mut reassembled = Vec::new();
        for (index, packet) in packets.iter().enumerate() {
            let header = PacketHeader::parse(packet).unwrap();
            assert_eq!(header.frame_id, 7);
            assert_eq!(header.fragment_index, index as u16);
            assert_eq!(header.fragment_count, 3);
            reassembled.extend_from_slice(&packet[PACKET_HEADER_LEN..]);
        }
        assert_eq!(reassembled, envelope);
    }

    #[test]
    fn empty_envelope_still_produces_one_fragment() {
        let packets = fragment(1, &[], 37, FLAG_CONTROL);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), PACKET_HEADER_LEN);
    }

    #[tokio::test]
    async fn frames_cross_a_loopback_pair() {
        let (left, right) = LoopbackLink::pair(48);
        let a = GattTransport::start(left, test_config());
        let b = GattTransport::start(right, test_config());

        let frame = Frame::Data(DataPayload {
            sequence: 0,
            payload: vec![0xAB; 200],
        });
        a.send(frame.clone()).await.unwrap();
        assert_eq!(b.next_frame().await.unwrap(), frame);

        b.send(Frame::Ping(42)).await.unwrap();
        assert_eq!(a.next_frame().await.unwrap(), Frame::Ping(42));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn ack_frees_window_slots() {
        let (left, right) = LoopbackLink::pair(64);
        let mut config = test_config();
        config.window_size = 1;
        let a = GattTransport::start(left, config);
        let b = GattTransport::start(right, test_config());

        a.send(Frame::Data(DataPayload {
            sequence: 0,
            payload: vec![1],
        }))
        .await
        .unwrap();
        assert!(matches!(b.next_frame().await.unwrap(), Frame::Data(_)));

        // Window is full; the second send must block until the ACK lands.
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            a.send(Frame::Data(DataPayload {
                sequence: 1,
                payload: vec![2],
            })),
        )
        .await;
        assert!(second.is_err(), "send should await a window slot");

        b.send(Frame::Ack(AckPayload {
            cumulative: 0,
            nack_bitmap: 0,
        }))
        .await
        .unwrap();

        tokio::time::timeout(
            Duration::from_millis(500),
            a.send(Frame::Data(DataPayload {
                sequence: 1,
                payload: vec![2],
            })),
        )
        .await
        .expect("slot freed by ack")
        .unwrap();

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn timed_out_bulk_frame_is_retransmitted() {
        let (left, right) = LoopbackLink::pair(64);

        // Drop the first bulk packet outright.
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = dropped.clone();
        left.set_loss_filter(Box::new(move |packet| {
            let header = PacketHeader::parse(packet);
            let is_bulk = header.map(|h| h.flags == FLAG_BULK).unwrap_or(false);
            is_bulk && counter.fetch_add(1, Ordering::Relaxed) == 0
        }))
        .await;

        let a = GattTransport::start(left, test_config());
        let b = GattTransport::start(right, test_config());

        let frame = Frame::Data(DataPayload {
            sequence: 3,
            payload: vec![3; 8],
        });
        a.send(frame.clone()).await.unwrap();

        // First copy was lost; the retry sweep must deliver the second.
        let received = tokio::time::timeout(Duration::from_secs(1), b.next_frame())
            .await
            .expect("retransmission must arrive")
            .unwrap();
        assert_eq!(received, frame);

        a.close().await;
        b.close().await;
    }
}
