//! Length-delimited envelope framing for [`Frame`]s.
//!
//! Envelope layout (big-endian):
//! ```text
//! [0..4]   magic    "GHST"
//! [4]      version  1
//! [5]      kind     1..=12
//! [6..10]  body len (u32)
//! [10..]   body     serde_json of the variant payload
//! ```

use crate::error::{GhostDropError, Result};
use crate::protocol::frame::{
    AckPayload, CancelPayload, CompletePayload, DataPayload, EncryptedPayload, Frame,
    HelloAckPayload, HelloPayload, MetadataPayload, ResumePayload, VerifyPayload,
};

pub const MAGIC: [u8; 4] = *b"GHST";
pub const VERSION: u8 = 1;
pub const ENVELOPE_HEADER_LEN: usize = 10;

fn encode_body(frame: &Frame) -> Result<Vec<u8>> {
    let body = match frame {
        Frame::Hello(p) => serde_json::to_vec(p),
        Frame::HelloAck(p) => serde_json::to_vec(p),
        Frame::Verify(p) => serde_json::to_vec(p),
        Frame::VerifyAck(matched) => serde_json::to_vec(matched),
        Frame::Metadata(p) => serde_json::to_vec(p),
        Frame::Data(p) => serde_json::to_vec(p),
        Frame::Ack(p) => serde_json::to_vec(p),
        Frame::Resume(p) => serde_json::to_vec(p),
        Frame::Complete(p) => serde_json::to_vec(p),
        Frame::Cancel(p) => serde_json::to_vec(p),
        Frame::Ping(token) => serde_json::to_vec(token),
        Frame::Encrypted(p) => serde_json::to_vec(p),
    };
    body.map_err(|err| GhostDropError::FrameEncoding(err.to_string()))
}

fn decode_body(kind: u8, body: &[u8]) -> Result<Frame> {
    let malformed = |err: serde_json::Error| GhostDropError::FrameDecoding(err.to_string());
    let frame = match kind {
        1 => Frame::Hello(serde_json::from_slice::<HelloPayload>(body).map_err(malformed)?),
        2 => Frame::HelloAck(serde_json::from_slice::<HelloAckPayload>(body).map_err(malformed)?),
        3 => Frame::Verify(serde_json::from_slice::<VerifyPayload>(body).map_err(malformed)?),
        4 => Frame::VerifyAck(serde_json::from_slice::<bool>(body).map_err(malformed)?),
        5 => Frame::Metadata(serde_json::from_slice::<MetadataPayload>(body).map_err(malformed)?),
        6 => Frame::Data(serde_json::from_slice::<DataPayload>(body).map_err(malformed)?),
        7 => Frame::Ack(serde_json::from_slice::<AckPayload>(body).map_err(malformed)?),
        8 => Frame::Resume(serde_json::from_slice::<ResumePayload>(body).map_err(malformed)?),
        9 => Frame::Complete(serde_json::from_slice::<CompletePayload>(body).map_err(malformed)?),
        10 => Frame::Cancel(serde_json::from_slice::<CancelPayload>(body).map_err(malformed)?),
        11 => Frame::Ping(serde_json::from_slice::<u32>(body).map_err(malformed)?),
        12 => Frame::Encrypted(serde_json::from_slice::<EncryptedPayload>(body).map_err(malformed)?),
        other => {
            return Err(GhostDropError::FrameDecoding(format!(
                "unknown frame kind {other}"
            )))
        }
    };
    Ok(frame)
}

/// Serialize a frame into its wire envelope.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let body = encode_body(frame)?;
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(frame.kind());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse exactly one envelope. The slice must contain the whole envelope and
/// nothing else.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let (frame, consumed) = decode_prefix(bytes)?
        .ok_or_else(|| GhostDropError::FrameDecoding("truncated envelope".into()))?;
    if consumed != bytes.len() {
        return Err(GhostDropError::FrameDecoding(format!(
            "{} trailing bytes after envelope",
            bytes.len() - consumed
        )));
    }
    Ok(frame)
}

/// Try to parse one envelope from the head of `bytes`. Returns `None` when
/// more bytes are needed.
fn decode_prefix(bytes: &[u8]) -> Result<Option<(Frame, usize)>> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Ok(None);
    }
    if bytes[0..4] != MAGIC {
        return Err(GhostDropError::FrameDecoding("bad envelope magic".into()));
    }
    if bytes[4] != VERSION {
        return Err(GhostDropError::FrameDecoding(format!(
            "unsupported envelope version {}",
            bytes[4]
        )));
    }
    let kind = bytes[5];
    let body_len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let total = ENVELOPE_HEADER_LEN + body_len;
    if bytes.len() < total {
        return Ok(None);
    }
    let frame = decode_body(kind, &bytes[ENVELOPE_HEADER_LEN..total])?;
    Ok(Some((frame, total)))
}

/// Destructively drain every complete envelope from the head of `buffer`,
/// leaving a partial tail in place. On the first malformed envelope the
/// buffer contents are unspecified and the caller must discard them.
pub fn consume_frames(buffer: &mut Vec<u8>) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        match decode_prefix(&buffer[offset..]) {
            Ok(Some((frame, consumed))) => {
                frames.push(frame);
                offset += consumed;
            }
            Ok(None) => break,
            Err(err) => {
                buffer.drain(..offset);
                return Err(err);
            }
        }
    }
    buffer.drain(..offset);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, GhostCapabilities};
    use uuid::Uuid;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Hello(HelloPayload {
                session_id: Uuid::new_v4(),
                device_id: DeviceId::generate(),
                public_key: vec![0x04; 65],
                nonce: [7u8; 16],
                capabilities: GhostCapabilities::default(),
            }),
            Frame::HelloAck(HelloAckPayload {
                session_id: Uuid::new_v4(),
                public_key: vec![0x04; 65],
                nonce: [9u8; 16],
            }),
            Frame::Verify(VerifyPayload {
                transcript_hash: [0xAB; 32],
                sas_code: "042137".into(),
            }),
            Frame::VerifyAck(true),
            Frame::Metadata(MetadataPayload {
                transfer_id: Uuid::new_v4(),
                file_name: "notes.txt".into(),
                file_size: 512,
                mime_type: "text/plain".into(),
                sha256: [0x11; 32],
                chunk_size: 128,
            }),
            Frame::Data(DataPayload {
                sequence: 3,
                payload: vec![1, 2, 3, 4],
            }),
            Frame::Ack(AckPayload {
                cumulative: 10,
                nack_bitmap: 0b101,
            }),
            Frame::Resume(ResumePayload {
                transfer_id: Uuid::new_v4(),
                last_confirmed: 49,
            }),
            Frame::Complete(CompletePayload {
                transfer_id: Uuid::new_v4(),
                sha256: [0x22; 32],
            }),
            Frame::Cancel(CancelPayload {
                reason: "user abort".into(),
            }),
            Frame::Ping(0xDEAD),
            Frame::Encrypted(EncryptedPayload {
                sequence: 5,
                combined: vec![9; 48],
            }),
        ]
    }

    #[test]
    fn roundtrip_every_variant() {
        for frame in sample_frames() {
            let bytes = encode(&frame).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, frame, "variant {}", frame.label());
        }
    }

    #[test]
    fn kinds_are_stable() {
        let kinds: Vec<u8> = sample_frames().iter().map(Frame::kind).collect();
        assert_eq!(kinds, (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = encode(&Frame::Ping(1)).unwrap();
        bytes[0] = b'X';
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = encode(&Frame::Ping(1)).unwrap();
        bytes[4] = 2;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut bytes = encode(&Frame::Ping(1)).unwrap();
        bytes[5] = 42;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode(&Frame::Ping(1)).unwrap();
        bytes.push(0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_mismatched_body() {
        // an Ack body under the Verify kind
        let mut bytes = encode(&Frame::Ack(AckPayload {
            cumulative: 1,
            nack_bitmap: 0,
        }))
        .unwrap();
        bytes[5] = 3;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn consume_drains_concatenated_envelopes() {
        let frames = sample_frames();
        let mut buffer = Vec::new();
        for frame in &frames {
            buffer.extend_from_slice(&encode(frame).unwrap());
        }
        let drained = consume_frames(&mut buffer).unwrap();
        assert_eq!(drained, frames);
        assert!(buffer.is_empty());
    }

    #[test]
    fn consume_leaves_partial_tail() {
        let first = encode(&Frame::Ping(1)).unwrap();
        let second = encode(&Frame::Ping(2)).unwrap();
        let mut buffer = first.clone();
        buffer.extend_from_slice(&second[..second.len() - 3]);

        let drained = consume_frames(&mut buffer).unwrap();
        assert_eq!(drained, vec![Frame::Ping(1)]);
        assert_eq!(buffer, &second[..second.len() - 3]);

        buffer.extend_from_slice(&second[second.len() - 3..]);
        let drained = consume_frames(&mut buffer).unwrap();
        assert_eq!(drained, vec![Frame::Ping(2)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn consume_fails_on_malformed_envelope() {
        let mut buffer = encode(&Frame::Ping(1)).unwrap();
        buffer.extend_from_slice(b"garbage-not-an-envelope");
        assert!(consume_frames(&mut buffer).is_err());
    }
}
