//! Typed protocol frames exchanged between two peers.
//!
//! The envelope in [`super::codec`] carries the variant tag; the payload
//! structs here are the serialized frame bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{DeviceId, GhostCapabilities};

/// Handshake opener, sent by the initiating peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub session_id: Uuid,
    pub device_id: DeviceId,
    /// SEC1-encoded uncompressed P-256 point.
    pub public_key: Vec<u8>,
    pub nonce: [u8; 16],
    pub capabilities: GhostCapabilities,
}

/// Handshake reply carrying the responder's ephemeral material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAckPayload {
    pub session_id: Uuid,
    pub public_key: Vec<u8>,
    pub nonce: [u8; 16],
}

/// Transcript commitment plus the short authentication string shown to the
/// user on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPayload {
    pub transcript_hash: [u8; 32],
    pub sas_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPayload {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub sha256: [u8; 32],
    pub chunk_size: u32,
}

/// One bulk chunk. After verification the payload bytes are the AEAD
/// `ciphertext ∥ tag` sealed against `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Cumulative acknowledgement with a selective-retransmit bitmap covering
/// `cumulative + 1 ..= cumulative + 64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub cumulative: u64,
    pub nack_bitmap: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    pub transfer_id: Uuid,
    pub last_confirmed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub transfer_id: Uuid,
    pub sha256: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub reason: String,
}

/// A sealed envelope: any control frame AEAD-encrypted under the session's
/// directional key at `sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub sequence: u64,
    pub combined: Vec<u8>,
}

/// The protocol frame union. Wire kinds are assigned in declaration order,
/// 1 through 12.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(HelloPayload),
    HelloAck(HelloAckPayload),
    Verify(VerifyPayload),
    VerifyAck(bool),
    Metadata(MetadataPayload),
    Data(DataPayload),
    Ack(AckPayload),
    Resume(ResumePayload),
    Complete(CompletePayload),
    Cancel(CancelPayload),
    Ping(u32),
    Encrypted(EncryptedPayload),
}

impl Frame {
    /// Wire tag carried in the envelope header.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Hello(_) => 1,
            Frame::HelloAck(_) => 2,
            Frame::Verify(_) => 3,
            Frame::VerifyAck(_) => 4,
            Frame::Metadata(_) => 5,
            Frame::Data(_) => 6,
            Frame::Ack(_) => 7,
            Frame::Resume(_) => 8,
            Frame::Complete(_) => 9,
            Frame::Cancel(_) => 10,
            Frame::Ping(_) => 11,
            Frame::Encrypted(_) => 12,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::HelloAck(_) => "hello_ack",
            Frame::Verify(_) => "verify",
            Frame::VerifyAck(_) => "verify_ack",
            Frame::Metadata(_) => "metadata",
            Frame::Data(_) => "data",
            Frame::Ack(_) => "ack",
            Frame::Resume(_) => "resume",
            Frame::Complete(_) => "complete",
            Frame::Cancel(_) => "cancel",
            Frame::Ping(_) => "ping",
            Frame::Encrypted(_) => "encrypted",
        }
    }

    /// Bulk frames ride the windowed write-without-response path; everything
    /// else is control traffic.
    pub fn is_bulk(&self) -> bool {
        matches!(self, Frame::Data(_))
    }
}
