// Identity providers - where the device keypair comes from at startup

use super::IdentityKeys;
use anyhow::{Context, Result};

/// Supplies the device keypair. Hosts that keep keys in a platform keystore
/// implement this; the engine never persists keys itself.
pub trait IdentityProvider: Send + Sync {
    fn load_keys(&self) -> Result<IdentityKeys>;
}

/// Fresh keys on every load
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralIdentity;

impl IdentityProvider for EphemeralIdentity {
    fn load_keys(&self) -> Result<IdentityKeys> {
        tracing::debug!("Generating ephemeral identity");
        Ok(IdentityKeys::generate())
    }
}

/// Keys handed in by the host (e.g. a CLI flag)
#[derive(Clone)]
pub struct StaticIdentity {
    keys: IdentityKeys,
}

impl StaticIdentity {
    pub fn new(keys: IdentityKeys) -> Self {
        Self { keys }
    }

    pub fn from_hex(private_key_hex: &str) -> Result<Self> {
        let keys = IdentityKeys::from_hex(private_key_hex).context("Invalid private key")?;
        Ok(Self { keys })
    }
}

impl IdentityProvider for StaticIdentity {
    fn load_keys(&self) -> Result<IdentityKeys> {
        Ok(self.keys.clone())
    }
}
