//! Device identity, advertised capabilities and the BLE advertisement
//! service-data codec.
//!
//! Pure data module — no radio dependencies.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 128-bit GhostDrop GATT service UUID.
pub const SERVICE_UUID: &str = "BFA6E968-0F36-4888-8F63-C8EC01385E67";

/// Data characteristic: notify + write-without-response.
pub const DATA_CHARACTERISTIC_UUID: &str = "BFA6E968-0F36-4888-8F63-C8EC01380603";

/// Control characteristic: notify + write-with-response.
pub const CONTROL_CHARACTERISTIC_UUID: &str = "BFA6E968-0F36-4888-8F63-C8EC01380604";

/// Capabilities characteristic: read-only.
pub const CAPABILITIES_CHARACTERISTIC_UUID: &str = "BFA6E968-0F36-4888-8F63-C8EC01380605";

/// Current advertisement / handshake protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Smallest packet size any GATT link is assumed to carry.
pub const MIN_CHUNK: u32 = 40;

/// Total encoded size of the advertisement service data.
pub const SERVICE_DATA_LEN: usize = 10;

const FLAG_L2CAP: u8 = 0b0000_0001;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// 128-bit opaque identifier, minted once per device install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Receiver-advertised transfer parameters, consumed by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhostCapabilities {
    pub supports_l2cap: bool,
    pub max_chunk: u32,
    pub max_window: u32,
    pub protocol_version: u32,
}

impl Default for GhostCapabilities {
    fn default() -> Self {
        Self {
            supports_l2cap: false,
            max_chunk: 4096,
            max_window: 8,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl GhostCapabilities {
    /// Clamp advertised values into the ranges the engine can honour.
    pub fn normalised(mut self) -> Self {
        self.max_chunk = self.max_chunk.max(MIN_CHUNK);
        self.max_window = self.max_window.max(1);
        self
    }
}

/// Ephemeral discovery record for a device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyDevice {
    pub id: DeviceId,
    pub display_name: String,
    pub rssi: i16,
    pub capabilities: GhostCapabilities,
    #[serde(default)]
    pub l2cap_psm: Option<u16>,
}

// ---------------------------------------------------------------------------
// Advertisement service data (10 bytes)
// ---------------------------------------------------------------------------

/// Decoded advertisement service-data payload.
///
/// Layout (10 bytes, big-endian):
/// ```text
/// [0]      protocol version  (1 B)
/// [1]      flags             (1 B) — bit 0: L2CAP channel available
/// [2..6]   max_chunk         (4 B)
/// [6..8]   max_window        (2 B)
/// [8..10]  l2cap PSM         (2 B) — 0 when absent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceData {
    pub capabilities: GhostCapabilities,
    pub l2cap_psm: Option<u16>,
}

impl ServiceData {
    pub fn new(capabilities: GhostCapabilities, l2cap_psm: Option<u16>) -> Self {
        Self {
            capabilities: capabilities.normalised(),
            l2cap_psm,
        }
    }

    /// Serialize to the fixed 10-byte advertisement payload.
    pub fn encode(&self) -> [u8; SERVICE_DATA_LEN] {
        let caps = self.capabilities.normalised();
        let mut buf = [0u8; SERVICE_DATA_LEN];
        buf[0] = caps.protocol_version.min(u8::MAX as u32) as u8;
        if caps.supports_l2cap {
            buf[1] |= FLAG_L2CAP;
        }
        buf[2..6].copy_from_slice(&caps.max_chunk.to_be_bytes());
        let window = caps.max_window.min(u16::MAX as u32) as u16;
        buf[6..8].copy_from_slice(&window.to_be_bytes());
        buf[8..10].copy_from_slice(&self.l2cap_psm.unwrap_or(0).to_be_bytes());
        buf
    }

    /// Deserialize from a byte slice (must be exactly 10 bytes).
    pub fn decode(bytes: &[u8]) -> Result<Self, CapabilityError> {
        if bytes.len() != SERVICE_DATA_LEN {
            return Err(CapabilityError::InvalidLength {
                expected: SERVICE_DATA_LEN,
                got: bytes.len(),
            });
        }
        let version = bytes[0] as u32;
        if version != PROTOCOL_VERSION {
            return Err(CapabilityError::UnsupportedVersion(bytes[0]));
        }
        let max_chunk = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let max_window = u16::from_be_bytes([bytes[6], bytes[7]]) as u32;
        let psm = u16::from_be_bytes([bytes[8], bytes[9]]);
        let capabilities = GhostCapabilities {
            supports_l2cap: bytes[1] & FLAG_L2CAP != 0,
            max_chunk,
            max_window,
            protocol_version: version,
        }
        .normalised();
        Ok(Self {
            capabilities,
            l2cap_psm: if psm == 0 { None } else { Some(psm) },
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid service data length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

impl From<CapabilityError> for crate::error::GhostDropError {
    fn from(err: CapabilityError) -> Self {
        crate::error::GhostDropError::InvalidCapabilities(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_data_roundtrip() {
        let caps = GhostCapabilities {
            supports_l2cap: true,
            max_chunk: 8192,
            max_window: 16,
            protocol_version: PROTOCOL_VERSION,
        };
        let sd = ServiceData::new(caps, Some(0x0081));
        let bytes = sd.encode();
        assert_eq!(bytes.len(), SERVICE_DATA_LEN);

        let decoded = ServiceData::decode(&bytes).unwrap();
        assert_eq!(decoded, sd);
    }

    #[test]
    fn psm_zero_decodes_as_absent() {
        let sd = ServiceData::new(GhostCapabilities::default(), None);
        let decoded = ServiceData::decode(&sd.encode()).unwrap();
        assert_eq!(decoded.l2cap_psm, None);
    }

    #[test]
    fn decode_wrong_length() {
        assert!(ServiceData::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn decode_unsupported_version() {
        let mut bytes = ServiceData::new(GhostCapabilities::default(), None).encode();
        bytes[0] = 99;
        assert!(matches!(
            ServiceData::decode(&bytes),
            Err(CapabilityError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn normalisation_clamps_floors() {
        let caps = GhostCapabilities {
            supports_l2cap: false,
            max_chunk: 1,
            max_window: 0,
            protocol_version: PROTOCOL_VERSION,
        }
        .normalised();
        assert_eq!(caps.max_chunk, MIN_CHUNK);
        assert_eq!(caps.max_window, 1);
    }
}
