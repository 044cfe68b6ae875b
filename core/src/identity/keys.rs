// Cryptographic key management

use crate::protocol::{Packet, PeerKey, ProtocolError};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// Length of the serialized private key (seed ‖ public key)
pub const PRIVATE_KEY_LEN: usize = 64;

/// Length of the Ed25519 seed
pub const SEED_LEN: usize = 32;

/// Identity keys: one Ed25519 keypair per device
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Import a keypair from a 32-byte seed or a 64-byte seed ‖ public key
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes.len() {
            SEED_LEN => {
                let mut seed = [0u8; SEED_LEN];
                seed.copy_from_slice(bytes);
                let signing_key = SigningKey::from_bytes(&seed);
                seed.zeroize();
                Ok(Self { signing_key })
            }
            PRIVATE_KEY_LEN => {
                let mut keypair = [0u8; PRIVATE_KEY_LEN];
                keypair.copy_from_slice(bytes);
                let result = SigningKey::from_keypair_bytes(&keypair).map_err(|_| {
                    ProtocolError::Argument(
                        "public half does not match the private seed".to_string(),
                    )
                });
                keypair.zeroize();
                Ok(Self {
                    signing_key: result?,
                })
            }
            other => Err(ProtocolError::Argument(format!(
                "private key must be {SEED_LEN} or {PRIVATE_KEY_LEN} bytes, got {other}"
            ))),
        }
    }

    /// Import from hex (seed or seed ‖ public key)
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|e| ProtocolError::Argument(format!("invalid hex key: {e}")))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Private key as seed ‖ public key.
    /// Returns a `Zeroizing` buffer that wipes the secret on drop.
    pub fn private_key_bytes(&self) -> Zeroizing<[u8; PRIVATE_KEY_LEN]> {
        Zeroizing::new(self.signing_key.to_keypair_bytes())
    }

    pub fn public_key(&self) -> PeerKey {
        PeerKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        self.public_key().to_hex()
    }

    /// Display fingerprint: SHA-256 of the public key, hex
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    /// BLE service UUID this device advertises
    pub fn ble_service_uuid(&self) -> Uuid {
        ble_service_uuid(&self.public_key())
    }

    /// Sign raw bytes
    pub fn sign_bytes(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Sign a packet in place over its signable bytes.
    ///
    /// The packet must name this key as its sender.
    pub fn sign(&self, packet: &mut Packet) -> Result<(), ProtocolError> {
        if packet.sender != self.public_key() {
            return Err(ProtocolError::Argument(format!(
                "packet sender {} is not this identity",
                packet.sender.short()
            )));
        }
        packet.signature = self.sign_bytes(&packet.signable_bytes());
        Ok(())
    }

    /// Verify a packet's signature against its declared sender
    pub fn verify(packet: &Packet) -> bool {
        verify_bytes(
            &packet.signable_bytes(),
            &packet.signature,
            &packet.sender,
        )
    }
}

/// Verify a detached signature; malformed keys verify as false
pub fn verify_bytes(data: &[u8], signature: &[u8; 64], public_key: &PeerKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let sig = Ed25519Signature::from_bytes(signature);
    verifying_key.verify(data, &sig).is_ok()
}

/// Service UUID derived from the last 16 bytes of a public key.
///
/// Pure function of `key[16..32]`: keys sharing those bytes share a UUID.
pub fn ble_service_uuid(key: &PeerKey) -> Uuid {
    let mut tail = [0u8; 16];
    tail.copy_from_slice(&key.as_bytes()[16..32]);
    Uuid::from_bytes(tail)
}

/// SHA-256 fingerprint of a public key, hex
pub fn fingerprint(key: &PeerKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
