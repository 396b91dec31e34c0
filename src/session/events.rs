//! Session event fan-out to UI subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::device::NearbyDevice;
use crate::logging::LogEntry;
use crate::metrics::TransferProgress;
use crate::session::SessionState;
use crate::transport::TransportKind;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the UI layer can observe about a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    NearbyDevicesUpdated { devices: Vec<NearbyDevice> },
    Connected { device: NearbyDevice },
    TransportSelected { transport: TransportKind },
    HandshakeSas { code: String },
    VerificationRequired,
    TransferProgress(TransferProgress),
    TransferCompleted { file_name: String },
    TransferFailed { message: String },
    Log(LogEntry),
}

/// Broadcast bus with a bounded queue per subscriber. A slow subscriber
/// lags (misses events) instead of blocking the session.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: an event with no subscribers is simply dropped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}
