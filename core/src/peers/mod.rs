//! Peer tracking
//!
//! Peers are keyed by their Ed25519 public key. Link addresses come and go
//! as BLE roles connect and disconnect; the directory stitches them onto one
//! record per identity.

mod directory;
mod peer;

pub use directory::PeerDirectory;
pub use peer::{AnnounceOutcome, ConnectionState, Peer, PeerAddresses, SweptPeer};
