//! Handshake key agreement and session-secret derivation.
//!
//! P-256 ECDH with fresh ephemeral keys per session, HKDF-SHA256 key
//! schedule, and the transcript-bound short authentication string both
//! users compare before any data moves.

pub mod session;

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{GhostDropError, Result};

pub use session::{Role, SessionCrypto};

const PROTOCOL_LABEL: &[u8] = b"GhostDrop-v1";
const SESSION_KEY_INFO: &[u8] = b"GhostDrop Session Keys";

/// Fresh P-256 key pair, generated once per handshake.
pub struct EphemeralHandshakeKey {
    secret: EphemeralSecret,
    public_bytes: Vec<u8>,
}

impl EphemeralHandshakeKey {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_bytes = secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self {
            secret,
            public_bytes,
        }
    }

    /// SEC1 uncompressed encoding of the public point, as sent on the wire.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public_bytes
    }

    /// Run ECDH against the peer's wire-encoded public key.
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; 32]> {
        let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|err| {
            GhostDropError::HandshakeFailed(format!("invalid peer public key: {err}"))
        })?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// 16-byte handshake nonce.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Session secrets, derived once after ECDH and immutable thereafter.
#[derive(Clone)]
pub struct HandshakeSecrets {
    pub enc_key_material: [u8; 32],
    pub mac_key_material: [u8; 32],
    pub transcript_hash: [u8; 32],
}

impl HandshakeSecrets {
    /// Derive the session secrets from both peers' handshake material.
    ///
    /// The transcript orders the two (public key, nonce) pairs by the
    /// lexicographic order of the public-key bytes, so both peers hash the
    /// identical byte string regardless of role.
    pub fn derive(
        session_id: &Uuid,
        local_public: &[u8],
        local_nonce: &[u8; 16],
        remote_public: &[u8],
        remote_nonce: &[u8; 16],
        shared_secret: &[u8; 32],
    ) -> Result<Self> {
        let ((a_pub, a_nonce), (b_pub, b_nonce)) = if local_public <= remote_public {
            ((local_public, local_nonce), (remote_public, remote_nonce))
        } else {
            ((remote_public, remote_nonce), (local_public, local_nonce))
        };

        let mut hasher = Sha256::new();
        hasher.update(PROTOCOL_LABEL);
        hasher.update(session_id.as_bytes());
        hasher.update(a_pub);
        hasher.update(a_nonce);
        hasher.update(b_pub);
        hasher.update(b_nonce);
        let mut transcript_hash = [0u8; 32];
        transcript_hash.copy_from_slice(&hasher.finalize());

        let hk = hkdf::Hkdf::<Sha256>::new(Some(&transcript_hash), shared_secret);
        let mut okm = [0u8; 64];
        hk.expand(SESSION_KEY_INFO, &mut okm)
            .map_err(|err| GhostDropError::HandshakeFailed(format!("hkdf expand: {err}")))?;

        let mut enc_key_material = [0u8; 32];
        let mut mac_key_material = [0u8; 32];
        enc_key_material.copy_from_slice(&okm[..32]);
        mac_key_material.copy_from_slice(&okm[32..]);

        Ok(Self {
            enc_key_material,
            mac_key_material,
            transcript_hash,
        })
    }
}

/// Six decimal digits derived from the transcript hash, compared by the
/// users of both devices.
pub fn derive_sas(transcript_hash: &[u8; 32]) -> String {
    let head = u32::from_be_bytes([
        transcript_hash[0],
        transcript_hash[1],
        transcript_hash[2],
        transcript_hash[3],
    ]);
    format!("{:06}", head % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_session_id() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap()
    }

    #[test]
    fn handshake_is_deterministic_across_roles() {
        let alice = EphemeralHandshakeKey::generate();
        let bob = EphemeralHandshakeKey::generate();
        let session_id = fixed_session_id();
        let nonce_a = [0x01u8; 16];
        let nonce_b = [0x02u8; 16];

        let shared_a = alice.agree(bob.public_bytes()).unwrap();
        let shared_b = bob.agree(alice.public_bytes()).unwrap();
        assert_eq!(shared_a, shared_b);

        let secrets_a = HandshakeSecrets::derive(
            &session_id,
            alice.public_bytes(),
            &nonce_a,
            bob.public_bytes(),
            &nonce_b,
            &shared_a,
        )
        .unwrap();
        let secrets_b = HandshakeSecrets::derive(
            &session_id,
            bob.public_bytes(),
            &nonce_b,
            alice.public_bytes(),
            &nonce_a,
            &shared_b,
        )
        .unwrap();

        assert_eq!(secrets_a.transcript_hash, secrets_b.transcript_hash);
        assert_eq!(secrets_a.enc_key_material, secrets_b.enc_key_material);
        assert_eq!(secrets_a.mac_key_material, secrets_b.mac_key_material);
        assert_eq!(
            derive_sas(&secrets_a.transcript_hash),
            derive_sas(&secrets_b.transcript_hash)
        );
    }

    #[test]
    fn sas_is_six_digits() {
        let sas = derive_sas(&[0xFFu8; 32]);
        assert_eq!(sas.len(), 6);
        assert!(sas.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn sas_zero_pads() {
        // 0x00000001 mod 1_000_000 == 1 → "000001"
        let mut hash = [0u8; 32];
        hash[3] = 1;
        assert_eq!(derive_sas(&hash), "000001");
    }

    #[test]
    fn agree_rejects_garbage_public_key() {
        let key = EphemeralHandshakeKey::generate();
        assert!(key.agree(&[0u8; 12]).is_err());
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
