//! Transport seam between the session engine and the radio.
//!
//! A [`FrameTransport`] moves whole protocol frames; the GATT variant
//! builds that on top of a [`PacketLink`], the narrow per-connection view
//! of the radio's packet I/O. The in-memory [`LoopbackLink`] stands in for
//! a radio link in tests and smoke runs.

pub mod gatt;
pub mod l2cap;
pub mod negotiator;
pub mod window;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::protocol::Frame;

pub use gatt::{GattConfig, GattTransport};
pub use l2cap::L2capTransport;
pub use negotiator::{negotiate, TransportFactory};
pub use window::SlidingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    L2cap,
    Gatt,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::L2cap => "l2cap",
            TransportKind::Gatt => "gatt",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport setup error: {0}")]
    Setup(String),
    #[error("transport io error: {0}")]
    Io(String),
    #[error("transport timed out: {0}")]
    Timeout(&'static str),
}

/// Frame-level transport chosen by the negotiator and owned by the
/// session. `next_frame` has a single consumer: the session's frame pump.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Await the next inbound frame. Errors are terminal for the stream.
    async fn next_frame(&self) -> Result<Frame, TransportError>;

    async fn close(&self);
}

/// Per-connection packet I/O the GATT transport drives: MTU-bounded
/// writes with an explicit flow-control probe for the unacknowledged
/// write path.
#[async_trait]
pub trait PacketLink: Send + Sync {
    fn max_packet_size(&self) -> usize;

    async fn write_packet(&self, packet: &[u8], with_response: bool) -> Result<(), TransportError>;

    /// Probe the write-without-response credit state.
    fn can_send_without_response(&self) -> bool;

    /// Await the link signalling readiness for another unacknowledged write.
    async fn wait_write_ready(&self) -> Result<(), TransportError>;

    /// Await the next inbound packet; `None` once the link is closed.
    async fn next_packet(&self) -> Option<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Loopback link
// ---------------------------------------------------------------------------

type LossFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// In-memory packet link: two halves connected by channels, with a
/// configurable MTU and an optional packet-loss hook for tests.
pub struct LoopbackLink {
    mtu: usize,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    loss_filter: Mutex<Option<LossFilter>>,
}

impl LoopbackLink {
    /// Build a connected pair of links, each seeing the other's writes.
    pub fn pair(mtu: usize) -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let left = Arc::new(LoopbackLink {
            mtu,
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
            loss_filter: Mutex::new(None),
        });
        let right = Arc::new(LoopbackLink {
            mtu,
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
            loss_filter: Mutex::new(None),
        });
        (left, right)
    }

    /// Install a hook deciding, per outbound packet, whether to drop it.
    pub async fn set_loss_filter(&self, filter: LossFilter) {
        *self.loss_filter.lock().await = Some(filter);
    }
}

#[async_trait]
impl PacketLink for LoopbackLink {
    fn max_packet_size(&self) -> usize {
        self.mtu
    }

    async fn write_packet(&self, packet: &[u8], _with_response: bool) -> Result<(), TransportError> {
        if let Some(filter) = self.loss_filter.lock().await.as_mut() {
            if filter(packet) {
                log::trace!("loopback dropping {}-byte packet", packet.len());
                return Ok(());
            }
        }
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn can_send_without_response(&self) -> bool {
        true
    }

    async fn wait_write_ready(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_packet(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_both_ways() {
        let (left, right) = LoopbackLink::pair(64);
        left.write_packet(b"ping", false).await.unwrap();
        assert_eq!(right.next_packet().await.unwrap(), b"ping");
        right.write_packet(b"pong", true).await.unwrap();
        assert_eq!(left.next_packet().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn loss_filter_drops_packets() {
        let (left, right) = LoopbackLink::pair(64);
        left.set_loss_filter(Box::new(|packet| packet == b"lost"))
            .await;
        left.write_packet(b"lost", false).await.unwrap();
        left.write_packet(b"kept", false).await.unwrap();
        assert_eq!(right.next_packet().await.unwrap(), b"kept");
    }
}
