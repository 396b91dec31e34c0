//! GhostDrop — peer-to-peer file transfer for short-range BLE links.
//!
//! The crate is the session core: handshake with user-verified SAS,
//! sequence-bound AEAD, resumable chunked transfer, and a reliability
//! layer that turns MTU-bounded unacknowledged GATT writes into an
//! ordered frame stream, with an L2CAP fast path when both sides have
//! one. The concrete radio, UI, and file picking live behind the traits
//! in [`radio`] and the events in [`session`].

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConfigStore, EngineConfig, RuntimeSettings};
pub use device::{DeviceId, GhostCapabilities, NearbyDevice, ServiceData};
pub use error::{GhostDropError, Result};
pub use session::{EventBus, SessionEngine, SessionEvent, SessionState};
pub use store::{IncomingStore, ResumeStore};
pub use transport::{TransportError, TransportKind};
