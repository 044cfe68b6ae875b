// Peer record lifecycle: discovery, handshake, updates, loss and expiry

use meshwire_core::peers::SweptPeer;
use meshwire_core::{
    AnnounceOutcome, ConnectionState, IdentityKeys, LinkAddress, PeerDirectory, PeerKey,
    PROTOCOL_VERSION,
};
use std::time::Duration;

const STALE: Duration = Duration::from_secs(180);

fn key() -> PeerKey {
    IdentityKeys::generate().public_key()
}

fn link(directory: &PeerDirectory, device: &str) -> LinkAddress {
    let address = LinkAddress::ble(device);
    directory.on_discovered(&address, Some(-60));
    directory.on_transport_connected(&address);
    address
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let directory = PeerDirectory::new();
    let alice = key();

    let address = link(&directory, "dev-a");
    assert!(directory.peers().is_empty(), "unannounced links stay hidden");
    assert_eq!(directory.pending_addresses(), vec![address.clone()]);

    let outcome = directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);
    let peer = match outcome {
        AnnounceOutcome::New(peer) => peer,
        other => panic!("expected New, got {other:?}"),
    };
    assert_eq!(peer.nickname, "alice");
    assert_eq!(peer.connection_state, ConnectionState::Connected);
    assert_eq!(peer.addresses.ble_device_id.as_deref(), Some("dev-a"));
    assert_eq!(peer.rssi, Some(-60));
    assert!(directory.pending_addresses().is_empty());
    assert_eq!(directory.len(), 1);

    let again = directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);
    assert!(matches!(again, AnnounceOutcome::Refreshed(_)));

    let renamed = directory.on_announce(alice, "alice-2", PROTOCOL_VERSION, &address);
    let peer = match renamed {
        AnnounceOutcome::Updated(peer) => peer,
        other => panic!("expected Updated, got {other:?}"),
    };
    assert_eq!(peer.nickname, "alice-2");

    let lost = directory.on_transport_disconnected(&address).unwrap();
    assert_eq!(lost.public_key, alice);
    assert_eq!(lost.connection_state, ConnectionState::Disconnected);
    assert!(!directory.is_connected(&alice));
    assert!(directory.address_for(&alice).is_none());

    let address = link(&directory, "dev-a2");
    let back = directory.on_announce(alice, "alice-2", PROTOCOL_VERSION, &address);
    assert!(matches!(back, AnnounceOutcome::Reconnected(_)));
    assert_eq!(directory.address_for(&alice), Some(address.clone()));
    assert_eq!(directory.key_for_address(&address), Some(alice));
    assert_eq!(directory.len(), 1, "link record merged into the identity");
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_swept() {
    let directory = PeerDirectory::new();
    let alice = key();
    let address = link(&directory, "dev-a");
    directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);

    tokio::time::advance(STALE).await;
    assert!(directory.sweep_stale(STALE).is_empty(), "exactly at threshold is not stale");

    tokio::time::advance(Duration::from_secs(1)).await;
    let swept = directory.sweep_stale(STALE);
    assert_eq!(swept.len(), 1);
    let SweptPeer {
        peer,
        removed,
        was_connected,
    } = &swept[0];
    assert_eq!(peer.public_key, alice);
    assert!(*removed);
    assert!(*was_connected);
    assert!(directory.get(&alice).is_none());
    assert!(directory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activity_keeps_peer_alive() {
    let directory = PeerDirectory::new();
    let alice = key();
    let address = link(&directory, "dev-a");
    directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(directory.touch(&alice));
        assert!(directory.sweep_stale(STALE).is_empty());
    }
    assert!(directory.is_connected(&alice));
    assert!(!directory.touch(&key()));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_peer_is_demoted_once() {
    let directory = PeerDirectory::new();
    let alice = key();
    let address = link(&directory, "dev-a");
    directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);
    assert!(directory.set_persistent(&alice, true));

    tokio::time::advance(STALE + Duration::from_secs(1)).await;
    let swept = directory.sweep_stale(STALE);
    assert_eq!(swept.len(), 1);
    assert!(!swept[0].removed);
    assert_eq!(swept[0].peer.connection_state, ConnectionState::Disconnected);
    assert!(swept[0].peer.addresses.ble_device_id.is_none());

    let kept = directory.get(&alice).unwrap();
    assert!(kept.persistent);
    assert_eq!(kept.connection_state, ConnectionState::Disconnected);
    assert!(directory.key_for_address(&address).is_none());

    // Already demoted: later sweeps leave it alone
    tokio::time::advance(STALE * 2).await;
    assert!(directory.sweep_stale(STALE).is_empty());
    assert!(directory.get(&alice).is_some());

    // And it comes back through a fresh handshake
    let address = link(&directory, "dev-a");
    let back = directory.on_announce(alice, "alice", PROTOCOL_VERSION, &address);
    assert!(matches!(back, AnnounceOutcome::Reconnected(_)));
}

#[tokio::test(start_paused = true)]
async fn test_unidentified_links_expire_quietly() {
    let directory = PeerDirectory::new();
    directory.on_discovered(&LinkAddress::ble("stranger"), Some(-90));
    link(&directory, "half-open");
    assert_eq!(directory.len(), 2);

    tokio::time::advance(STALE + Duration::from_secs(1)).await;
    assert!(directory.sweep_stale(STALE).is_empty());
    assert!(directory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_device_reused_by_new_identity() {
    let directory = PeerDirectory::new();
    let (old, new) = (key(), key());
    let address = link(&directory, "dev-x");
    directory.on_announce(old, "before", PROTOCOL_VERSION, &address);

    let outcome = directory.on_announce(new, "after", PROTOCOL_VERSION, &address);
    assert!(matches!(outcome, AnnounceOutcome::New(_)));
    assert_eq!(directory.key_for_address(&address), Some(new));

    let previous = directory.get(&old).unwrap();
    assert_eq!(previous.connection_state, ConnectionState::Disconnected);
    assert!(previous.addresses.is_empty());
    assert_eq!(directory.connected_peers().len(), 1);
}
