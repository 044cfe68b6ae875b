// Meshwire Core - BLE mesh protocol engine
//
// Signed fixed-layout packets, fragmentation, dedup, an identity handshake
// and dual-role BLE link management, behind one `ProtocolEngine` facade.
//
// Delivery is direct: a peer we cannot reach right now is a failed send,
// never a queued one.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod identity;
pub mod peers;
pub mod platform;
pub mod protocol;
pub mod transport;

pub use config::{BleConfig, ConfigError, EngineConfig};
pub use dedup::BloomFilter;
pub use engine::{
    ChannelDelegate, EngineStats, EngineStatus, MeshDelegate, MeshError, MeshEvent,
    ProtocolEngine,
};
pub use identity::{
    EphemeralIdentity, IdentityKeys, IdentityManager, IdentityProvider, StaticIdentity,
};
pub use peers::{AnnounceOutcome, ConnectionState, Peer, PeerDirectory};
pub use platform::{AlwaysGranted, PermissionsProvider};
pub use protocol::{
    AnnouncePayload, FragmentAssembler, Packet, PacketType, PeerKey, ProtocolError,
    PROTOCOL_VERSION,
};
pub use transport::{
    LinkAddress, TransportChannel, TransportError, TransportEvent, TransportManager,
    TransportType,
};

/// Install the fmt subscriber with an `EnvFilter` (default `info`).
///
/// Idempotent: a subscriber installed earlier, by this or by the host, wins.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Like [`init_tracing`] with a custom default directive; `RUST_LOG` still
/// takes precedence
pub fn init_tracing_with(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}
