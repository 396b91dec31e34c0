//! Narrow interfaces onto the platform BLE stack.
//!
//! The engine never touches the radio directly: an embedding application
//! implements [`CentralAdapter`] (scanner side) and [`PeripheralAdapter`]
//! (advertiser side), and the adapters here bind one connected device to
//! the [`PacketLink`] the GATT transport drives.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::device::{DeviceId, GhostCapabilities, NearbyDevice, ServiceData};
use crate::error::GhostDropError;
use crate::transport::{PacketLink, TransportError};

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("bluetooth unavailable")]
    Unavailable,
    #[error("bluetooth unauthorized")]
    Unauthorized,
    #[error("radio io error: {0}")]
    Io(String),
}

impl From<RadioError> for GhostDropError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::Unavailable => GhostDropError::BluetoothUnavailable,
            RadioError::Unauthorized => GhostDropError::BluetoothUnauthorized,
            RadioError::Io(message) => GhostDropError::Io(message),
        }
    }
}

impl From<RadioError> for TransportError {
    fn from(err: RadioError) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Scanner/initiator half of the radio.
#[async_trait]
pub trait CentralAdapter: Send + Sync {
    /// Resolves once the radio is powered on; fails with
    /// `Unavailable`/`Unauthorized` when it never will be.
    async fn wait_until_powered_on(&self) -> Result<(), RadioError>;

    async fn start_scanning(&self) -> Result<(), RadioError>;
    async fn stop_scanning(&self);

    /// Snapshot updates of the devices currently in range.
    fn subscribe_nearby(&self) -> broadcast::Receiver<Vec<NearbyDevice>>;

    async fn connect(&self, device: DeviceId) -> Result<(), RadioError>;

    /// Discover the GhostDrop service and its data/control/capabilities
    /// characteristics on a connected device.
    async fn discover_transport_characteristics(&self, device: DeviceId)
        -> Result<(), RadioError>;

    /// Capabilities read from the advertisement or the capabilities
    /// characteristic, when known.
    async fn advertised_capabilities(&self, device: DeviceId) -> Option<GhostCapabilities>;

    /// Open a credit-based L2CAP channel on the peer's advertised PSM.
    async fn open_l2cap(
        &self,
        device: DeviceId,
        psm: u16,
    ) -> Result<(ByteReader, ByteWriter), RadioError>;

    /// Negotiated ATT payload size for the connection.
    fn max_packet_size(&self, device: DeviceId) -> usize;

    async fn write_packet(
        &self,
        device: DeviceId,
        packet: &[u8],
        with_response: bool,
    ) -> Result<(), RadioError>;

    fn can_send_write_without_response(&self, device: DeviceId) -> bool;

    async fn wait_write_without_response_ready(&self, device: DeviceId)
        -> Result<(), RadioError>;

    /// Take the notification stream for a connected device. Single
    /// consumer; subsequent calls return `None`.
    async fn take_incoming_packets(&self, device: DeviceId) -> Option<mpsc::Receiver<Vec<u8>>>;
}

/// Advertiser/responder half of the radio.
#[async_trait]
pub trait PeripheralAdapter: Send + Sync {
    async fn wait_until_powered_on(&self) -> Result<(), RadioError>;

    /// Publish the GhostDrop service and start advertising the encoded
    /// service data. Returns the dynamic L2CAP PSM when one was opened.
    async fn start_advertising(&self, service_data: ServiceData) -> Result<Option<u16>, RadioError>;

    async fn stop_advertising(&self);

    /// Writes arriving on the data/control characteristics. Single
    /// consumer; subsequent calls return `None`.
    async fn take_incoming_write_packets(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Push a packet to the subscribed central via notification.
    async fn notify_packet(&self, packet: &[u8]) -> Result<(), RadioError>;

    /// Accepted L2CAP channels. Single consumer; subsequent calls return
    /// `None`.
    async fn take_incoming_l2cap_channels(
        &self,
    ) -> Option<mpsc::Receiver<(ByteReader, ByteWriter)>>;
}

// ---------------------------------------------------------------------------
// PacketLink bindings
// ---------------------------------------------------------------------------

/// One connected peer seen through a [`CentralAdapter`], narrowed to the
/// packet I/O the GATT transport needs.
pub struct CentralPacketLink {
    central: Arc<dyn CentralAdapter>,
    device: DeviceId,
    packets: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl CentralPacketLink {
    /// Bind a connected device. Claims the device's notification stream.
    pub async fn bind(
        central: Arc<dyn CentralAdapter>,
        device: DeviceId,
    ) -> Result<Self, TransportError> {
        let packets = central
            .take_incoming_packets(device)
            .await
            .ok_or_else(|| TransportError::Setup("packet stream already claimed".into()))?;
        Ok(Self {
            central,
            device,
            packets: Mutex::new(packets),
        })
    }
}

#[async_trait]
impl PacketLink for CentralPacketLink {
    fn max_packet_size(&self) -> usize {
        self.central.max_packet_size(self.device)
    }

    async fn write_packet(&self, packet: &[u8], with_response: bool) -> Result<(), TransportError> {
        self.central
            .write_packet(self.device, packet, with_response)
            .await
            .map_err(Into::into)
    }

    fn can_send_without_response(&self) -> bool {
        self.central.can_send_write_without_response(self.device)
    }

    async fn wait_write_ready(&self) -> Result<(), TransportError> {
        self.central
            .wait_write_without_response_ready(self.device)
            .await
            .map_err(Into::into)
    }

    async fn next_packet(&self) -> Option<Vec<u8>> {
        self.packets.lock().await.recv().await
    }
}

/// The peripheral's view of its single connected central. Outbound packets
/// go out as notifications, which are never flow-control gated the way
/// write-without-response is.
pub struct PeripheralPacketLink {
    peripheral: Arc<dyn PeripheralAdapter>,
    max_packet_size: usize,
    packets: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl PeripheralPacketLink {
    pub async fn bind(
        peripheral: Arc<dyn PeripheralAdapter>,
        max_packet_size: usize,
    ) -> Result<Self, TransportError> {
        let packets = peripheral
            .take_incoming_write_packets()
            .await
            .ok_or_else(|| TransportError::Setup("write stream already claimed".into()))?;
        Ok(Self {
            peripheral,
            max_packet_size,
            packets: Mutex::new(packets),
        })
    }
}

#[async_trait]
impl PacketLink for PeripheralPacketLink {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn write_packet(&self, packet: &[u8], _with_response: bool) -> Result<(), TransportError> {
        self.peripheral
            .notify_packet(packet)
            .await
            .map_err(Into::into)
    }

    fn can_send_without_response(&self) -> bool {
        true
    }

    async fn wait_write_ready(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_packet(&self) -> Option<Vec<u8>> {
        self.packets.lock().await.recv().await
    }
}
