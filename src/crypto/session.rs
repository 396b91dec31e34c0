//! Directional AEAD context for a verified session.
//!
//! Each direction gets its own AES-256-GCM key and 4-byte nonce prefix,
//! derived from the shared encryption key material. Nonce = prefix ∥
//! big-endian sequence; the sequence also rides as associated data, which
//! makes replayed or reordered sealed frames fail authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::crypto::HandshakeSecrets;
use crate::error::{GhostDropError, Result};
use crate::protocol::{self, EncryptedPayload, Frame};

const DIRECTIONAL_SALT: &[u8] = b"ghostdrop-directional";
const NONCE_LEN: usize = 12;
const PREFIX_LEN: usize = 4;
const TAG_LEN: usize = 16;

/// Which half of the session this context seals for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    fn opposite(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

fn directional_key(enc_key_material: &[u8; 32], role: Role) -> Result<Aes256Gcm> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(DIRECTIONAL_SALT), enc_key_material);
    let mut key = [0u8; 32];
    hk.expand(role.label().as_bytes(), &mut key)
        .map_err(|err| GhostDropError::Encryption(format!("directional hkdf: {err}")))?;
    Aes256Gcm::new_from_slice(&key)
        .map_err(|err| GhostDropError::Encryption(format!("directional key: {err}")))
}

fn direction_prefix(role: Role) -> [u8; PREFIX_LEN] {
    let digest = Sha256::digest(format!("ghostdrop-{}", role.label()).as_bytes());
    let mut prefix = [0u8; PREFIX_LEN];
    prefix.copy_from_slice(&digest[..PREFIX_LEN]);
    prefix
}

fn build_nonce(prefix: &[u8; PREFIX_LEN], sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Sequence-bound seal/open context. Owned by the session; the send
/// sequence only ever moves forward.
pub struct SessionCrypto {
    seal_cipher: Aes256Gcm,
    open_cipher: Aes256Gcm,
    seal_prefix: [u8; PREFIX_LEN],
    open_prefix: [u8; PREFIX_LEN],
    send_sequence: u64,
}

impl SessionCrypto {
    pub fn new(secrets: &HandshakeSecrets, role: Role) -> Result<Self> {
        Ok(Self {
            seal_cipher: directional_key(&secrets.enc_key_material, role)?,
            open_cipher: directional_key(&secrets.enc_key_material, role.opposite())?,
            seal_prefix: direction_prefix(role),
            open_prefix: direction_prefix(role.opposite()),
            send_sequence: 0,
        })
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_sequence
    }

    fn encrypt(&self, cipher: &Aes256Gcm, nonce: &[u8; NONCE_LEN], plaintext: &[u8], sequence: u64) -> Result<Vec<u8>> {
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad: &sequence.to_be_bytes(),
                },
            )
            .map_err(|_| GhostDropError::Encryption(format!("seal failed at sequence {sequence}")))
    }

    fn decrypt(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8], sequence: u64) -> Result<Vec<u8>> {
        self.open_cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &sequence.to_be_bytes(),
                },
            )
            .map_err(|_| GhostDropError::Decryption(format!("open failed at sequence {sequence}")))
    }

    /// Seal a control frame under the next send sequence, producing the
    /// `Encrypted` wrapper to put on the wire.
    pub fn seal_frame(&mut self, frame: &Frame) -> Result<Frame> {
        let plaintext = protocol::encode(frame)?;
        let sequence = self.send_sequence;
        let nonce = build_nonce(&self.seal_prefix, sequence);
        let ciphertext = self.encrypt(&self.seal_cipher, &nonce, &plaintext, sequence)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        self.send_sequence += 1;
        Ok(Frame::Encrypted(EncryptedPayload { sequence, combined }))
    }

    /// Open an `Encrypted` wrapper from the peer and decode the inner frame.
    ///
    /// The nonce embedded in the sealed box must match the one recomputed
    /// from the receive prefix and the frame's sequence.
    pub fn open_frame(&self, frame: &Frame) -> Result<Frame> {
        let payload = match frame {
            Frame::Encrypted(payload) => payload,
            other => {
                return Err(GhostDropError::Decryption(format!(
                    "expected encrypted frame, got {}",
                    other.label()
                )))
            }
        };
        if payload.combined.len() < NONCE_LEN + TAG_LEN {
            return Err(GhostDropError::Decryption("sealed box too short".into()));
        }
        let expected = build_nonce(&self.open_prefix, payload.sequence);
        let (nonce, ciphertext) = payload.combined.split_at(NONCE_LEN);
        if nonce != expected {
            return Err(GhostDropError::Decryption(format!(
                "nonce mismatch at sequence {}",
                payload.sequence
            )));
        }
        let plaintext = self.decrypt(&expected, ciphertext, payload.sequence)?;
        protocol::decode(&plaintext)
    }

    /// Seal a chunk payload against its chunk sequence. Data frames carry
    /// the combined bytes directly rather than a nested `Encrypted` wrapper.
    pub fn seal_data_payload(&self, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = build_nonce(&self.seal_prefix, sequence);
        self.encrypt(&self.seal_cipher, &nonce, plaintext, sequence)
    }

    /// Open a chunk payload sealed by the peer at `sequence`.
    pub fn open_data_payload(&self, sequence: u64, combined: &[u8]) -> Result<Vec<u8>> {
        if combined.len() < TAG_LEN {
            return Err(GhostDropError::Decryption("sealed chunk too short".into()));
        }
        let nonce = build_nonce(&self.open_prefix, sequence);
        self.decrypt(&nonce, combined, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CancelPayload;

    fn secrets() -> HandshakeSecrets {
        HandshakeSecrets {
            enc_key_material: [0x42; 32],
            mac_key_material: [0x17; 32],
            transcript_hash: [0x99; 32],
        }
    }

    fn pair() -> (SessionCrypto, SessionCrypto) {
        let secrets = secrets();
        (
            SessionCrypto::new(&secrets, Role::Sender).unwrap(),
            SessionCrypto::new(&secrets, Role::Receiver).unwrap(),
        )
    }

    #[test]
    fn sealed_frame_opens_on_the_other_side() {
        let (mut sender, receiver) = pair();
        let frame = Frame::Cancel(CancelPayload {
            reason: "testing".into(),
        });
        let sealed = sender.seal_frame(&frame).unwrap();
        assert!(matches!(sealed, Frame::Encrypted(_)));
        let opened = receiver.open_frame(&sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    fn own_sealed_frame_is_rejected() {
        let (mut sender, _) = pair();
        let sealed = sender.seal_frame(&Frame::Ping(7)).unwrap();
        assert!(matches!(
            sender.open_frame(&sealed),
            Err(GhostDropError::Decryption(_))
        ));
    }

    #[test]
    fn send_sequence_increments_per_seal() {
        let (mut sender, receiver) = pair();
        assert_eq!(sender.send_sequence(), 0);
        let first = sender.seal_frame(&Frame::Ping(1)).unwrap();
        let second = sender.seal_frame(&Frame::Ping(2)).unwrap();
        assert_eq!(sender.send_sequence(), 2);

        match (&first, &second) {
            (Frame::Encrypted(a), Frame::Encrypted(b)) => {
                assert_eq!(a.sequence, 0);
                assert_eq!(b.sequence, 1);
            }
            _ => unreachable!(),
        }
        assert_eq!(receiver.open_frame(&first).unwrap(), Frame::Ping(1));
        assert_eq!(receiver.open_frame(&second).unwrap(), Frame::Ping(2));
    }

    #[test]
    fn data_payload_roundtrip() {
        let (sender, receiver) = pair();
        let chunk = vec![0xA5u8; 128];
        let combined = sender.seal_data_payload(9, &chunk).unwrap();
        assert_eq!(receiver.open_data_payload(9, &combined).unwrap(), chunk);
    }

    #[test]
    fn data_payload_rejects_wrong_sequence() {
        let (sender, receiver) = pair();
        let combined = sender.seal_data_payload(3, b"chunk").unwrap();
        assert!(receiver.open_data_payload(4, &combined).is_err());
    }

    #[test]
    fn corrupted_byte_fails_authentication() {
        let (sender, receiver) = pair();
        let combined = sender.seal_data_payload(0, b"integrity matters").unwrap();
        for index in 0..combined.len() {
            let mut tampered = combined.clone();
            tampered[index] ^= 0x01;
            assert!(
                receiver.open_data_payload(0, &tampered).is_err(),
                "byte {index} flip must not authenticate"
            );
        }
    }

    #[test]
    fn tampered_nonce_in_sealed_box_is_rejected() {
        let (mut sender, receiver) = pair();
        let sealed = sender.seal_frame(&Frame::Ping(1)).unwrap();
        let tampered = match sealed {
            Frame::Encrypted(mut payload) => {
                payload.combined[0] ^= 0xFF;
                Frame::Encrypted(payload)
            }
            _ => unreachable!(),
        };
        assert!(matches!(
            receiver.open_frame(&tampered),
            Err(GhostDropError::Decryption(_))
        ));
    }
}
