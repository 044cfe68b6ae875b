// Integration test: full engines over the in-process loopback radio
//
// Each node runs a ProtocolEngine on a BleCoordinator whose Central and
// Peripheral roles are backed by a shared LoopbackAir. These tests cover
// discovery → connect → ANNOUNCE → messaging → teardown without hardware.

mod common;

use common::{linked_pair, Node};
use meshwire_core::transport::ble::{CharacteristicProperties, GattCharacteristic, LoopbackAir};
use meshwire_core::{ConnectionState, EngineConfig, EngineStatus, MeshEvent};
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test(start_paused = true)]
async fn test_two_device_scenario() {
    let air = LoopbackAir::new();
    let (mut alpha, mut bravo) = linked_pair(&air, "alpha", "bravo").await;
    println!("✓ alpha and bravo completed the handshake");

    // Each side resolves the other with the announced nickname
    let seen_by_alpha = alpha.engine.peer(&bravo.key()).expect("bravo known to alpha");
    assert_eq!(seen_by_alpha.connection_state, ConnectionState::Connected);
    assert_eq!(seen_by_alpha.nickname, "bravo");
    let seen_by_bravo = bravo.engine.peer(&alpha.key()).expect("alpha known to bravo");
    assert_eq!(seen_by_bravo.nickname, "alpha");

    assert!(alpha.engine.send(&bravo.key(), b"hi").await);
    let (sender, payload) = bravo.wait_message().await;
    assert_eq!(sender, alpha.key());
    assert_eq!(payload, b"hi");
    println!("✓ alpha → bravo delivered");

    // Oversized payloads are fragmented and reassembled
    let big: Vec<u8> = (0..1_500u32).map(|i| (i % 251) as u8).collect();
    assert!(bravo.engine.send(&alpha.key(), &big).await);
    let (sender, payload) = alpha.wait_message().await;
    assert_eq!(sender, bravo.key());
    assert_eq!(payload, big);
    println!("✓ bravo → alpha 1500 bytes delivered in fragments");

    // Tear bravo's radio down: alpha fails fast, nothing queued
    air.power_off("bravo");
    alpha
        .wait_for(|e| matches!(e, MeshEvent::PeerDisconnected(p) if p.public_key == bravo.key()))
        .await;
    assert!(!alpha.engine.is_reachable(&bravo.key()));
    let started = tokio::time::Instant::now();
    assert!(!alpha.engine.send(&bravo.key(), b"anyone there?").await);
    assert_eq!(started.elapsed(), Duration::ZERO);

    // Nothing arrives later either
    tokio::time::sleep(Duration::from_secs(5)).await;
    while let Ok(event) = bravo.events.try_recv() {
        assert!(!matches!(event, MeshEvent::MessageReceived { .. }));
    }
    println!("✓ send after teardown failed immediately");
}

#[tokio::test(start_paused = true)]
async fn test_periodic_announce_keeps_peers_alive() {
    let air = LoopbackAir::new();
    let (alpha, bravo) = linked_pair(&air, "alpha", "bravo").await;

    // Well past the stale threshold (2 × 10 s)
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert!(alpha.engine.peer(&bravo.key()).unwrap().is_connected());
    assert!(bravo.engine.peer(&alpha.key()).unwrap().is_connected());
    assert!(alpha.engine.send(&bravo.key(), b"still here").await);
}

#[tokio::test(start_paused = true)]
async fn test_nickname_change_propagates() {
    let air = LoopbackAir::new();
    let (alpha, mut bravo) = linked_pair(&air, "alpha", "bravo").await;

    assert_ok!(alpha.engine.set_nickname("alpha-prime").await);
    let event = bravo
        .wait_for(|e| matches!(e, MeshEvent::PeerUpdated(_)))
        .await;
    let MeshEvent::PeerUpdated(peer) = event else {
        unreachable!()
    };
    assert_eq!(peer.public_key, alpha.key());
    assert_eq!(peer.nickname, "alpha-prime");
}

#[tokio::test(start_paused = true)]
async fn test_link_recovers_after_sever() {
    let air = LoopbackAir::new();
    let (mut alpha, bravo) = linked_pair(&air, "alpha", "bravo").await;

    air.sever("alpha", "bravo");
    alpha
        .wait_for(|e| matches!(e, MeshEvent::PeerDisconnected(p) if p.public_key == bravo.key()))
        .await;

    // Both still advertise, so the next scan cycle relinks and re-handshakes
    alpha.wait_connected(bravo.key()).await;
    assert!(alpha.engine.send(&bravo.key(), b"back").await);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_devices_never_become_peers() {
    let air = LoopbackAir::new();
    air.add_foreign_device(
        "thermometer",
        GattCharacteristic {
            uuid: uuid::Uuid::from_u128(0x0000_2A1C_0000_1000_8000_0080_5F9B_34FB),
            properties: CharacteristicProperties::DATA,
        },
    );
    air.add_unresponsive_device("brick");

    let alpha = Node::join(&air, "alpha");
    alpha.start().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(alpha.engine.peers().is_empty());
    assert_eq!(air.connection_attempts("thermometer"), 1);
    assert_eq!(air.connection_attempts("brick"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_acknowledged() {
    let air = LoopbackAir::new();
    let config = EngineConfig {
        delivery_acks: true,
        ..EngineConfig::default()
    };
    let mut alpha = Node::join_with(&air, "alpha", config.clone());
    let mut bravo = Node::join_with(&air, "bravo", config);
    alpha.start().await;
    bravo.start().await;
    alpha.wait_connected(bravo.key()).await;
    bravo.wait_connected(alpha.key()).await;

    let message_id = alpha.engine.try_send(&bravo.key(), &[1u8; 800]).await.unwrap();
    let event = alpha
        .wait_for(|e| matches!(e, MeshEvent::DeliveryAck { .. }))
        .await;
    assert_eq!(
        event,
        MeshEvent::DeliveryAck {
            peer: bravo.key(),
            message_id
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_every_peer() {
    let air = LoopbackAir::new();
    let mut alpha = Node::join(&air, "alpha");
    let mut bravo = Node::join(&air, "bravo");
    let mut charlie = Node::join(&air, "charlie");
    alpha.start().await;
    bravo.start().await;
    charlie.start().await;
    alpha.wait_connected(bravo.key()).await;
    alpha.wait_connected(charlie.key()).await;
    bravo.wait_connected(alpha.key()).await;
    charlie.wait_connected(alpha.key()).await;

    assert_eq!(alpha.engine.broadcast(b"hello mesh").await, 2);
    assert_eq!(bravo.wait_message().await, (alpha.key(), b"hello mesh".to_vec()));
    assert_eq!(charlie.wait_message().await, (alpha.key(), b"hello mesh".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_restart() {
    let air = LoopbackAir::new();
    let (mut alpha, mut bravo) = linked_pair(&air, "alpha", "bravo").await;

    alpha.engine.stop().await;
    assert_eq!(alpha.engine.status(), EngineStatus::Stopped);
    assert!(alpha.engine.connected_peers().is_empty());
    bravo
        .wait_for(|e| matches!(e, MeshEvent::PeerDisconnected(p) if p.public_key == alpha.key()))
        .await;

    alpha.engine.start().await.unwrap();
    alpha.wait_connected(bravo.key()).await;
    bravo.wait_connected(alpha.key()).await;
    assert!(alpha.engine.send(&bravo.key(), b"again").await);
}
