// Identity - one Ed25519 keypair per device plus a display nickname

mod keys;
mod provider;

pub use keys::{
    ble_service_uuid, fingerprint, verify_bytes, IdentityKeys, PRIVATE_KEY_LEN, SEED_LEN,
};
pub use provider::{EphemeralIdentity, IdentityProvider, StaticIdentity};

use crate::protocol::{Packet, PeerKey, ProtocolError};
use parking_lot::RwLock;
use uuid::Uuid;

/// Owns the device keys and the mutable display nickname
pub struct IdentityManager {
    keys: IdentityKeys,
    nickname: RwLock<String>,
}

impl IdentityManager {
    pub fn new(keys: IdentityKeys, nickname: impl Into<String>) -> Self {
        Self {
            keys,
            nickname: RwLock::new(nickname.into()),
        }
    }

    /// Load keys from a provider
    pub fn from_provider(
        provider: &dyn IdentityProvider,
        nickname: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let keys = provider.load_keys()?;
        tracing::info!("🔑 Identity ready: {}", keys.public_key().short());
        Ok(Self::new(keys, nickname))
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    pub fn public_key(&self) -> PeerKey {
        self.keys.public_key()
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn fingerprint(&self) -> String {
        self.keys.fingerprint()
    }

    pub fn ble_service_uuid(&self) -> Uuid {
        self.keys.ble_service_uuid()
    }

    pub fn nickname(&self) -> String {
        self.nickname.read().clone()
    }

    pub fn set_nickname(&self, nickname: impl Into<String>) {
        *self.nickname.write() = nickname.into();
    }

    /// Sign a packet whose sender is this device
    pub fn sign(&self, packet: &mut Packet) -> Result<(), ProtocolError> {
        self.keys.sign(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    #[test]
    fn test_identity_manager_from_ephemeral() {
        let manager = IdentityManager::from_provider(&EphemeralIdentity, "alice").unwrap();
        assert_eq!(manager.nickname(), "alice");
        assert_eq!(manager.public_key_hex().len(), 64);
        assert_eq!(
            manager.ble_service_uuid(),
            ble_service_uuid(&manager.public_key())
        );
    }

    #[test]
    fn test_identity_manager_static_is_deterministic() {
        let keys = IdentityKeys::generate();
        let hex_key = hex::encode(&keys.private_key_bytes()[..]);
        let provider = StaticIdentity::from_hex(&hex_key).unwrap();

        let a = IdentityManager::from_provider(&provider, "a").unwrap();
        let b = IdentityManager::from_provider(&provider, "b").unwrap();
        assert_eq!(a.public_key(), keys.public_key());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_nickname_update() {
        let manager = IdentityManager::new(IdentityKeys::generate(), "old");
        manager.set_nickname("new");
        assert_eq!(manager.nickname(), "new");
    }

    #[test]
    fn test_manager_signs_own_packets() {
        let manager = IdentityManager::new(IdentityKeys::generate(), "n");
        let mut packet =
            Packet::new(PacketType::Message, 7, manager.public_key(), None, b"x".to_vec())
                .unwrap();
        manager.sign(&mut packet).unwrap();
        assert!(IdentityKeys::verify(&packet));
    }
}
