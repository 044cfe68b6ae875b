// Shared fixtures for the integration tests

#![allow(dead_code)]

use meshwire_core::transport::ble::{BleCoordinator, LoopbackAir};
use meshwire_core::{
    BleConfig, ChannelDelegate, EngineConfig, EphemeralIdentity, IdentityManager, MeshEvent,
    PeerDirectory, PeerKey, ProtocolEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn fast_ble() -> BleConfig {
    BleConfig {
        connect_timeout_ms: 1_000,
        scan_timeout_ms: 500,
        rescan_interval_ms: 100,
        max_concurrent_connects: 1,
    }
}

pub struct Node {
    pub name: String,
    pub engine: ProtocolEngine,
    pub events: UnboundedReceiver<MeshEvent>,
}

impl Node {
    pub fn join(air: &LoopbackAir, name: &str) -> Self {
        Self::join_with(air, name, EngineConfig::default())
    }

    pub fn join_with(air: &LoopbackAir, name: &str, config: EngineConfig) -> Self {
        let (central, peripheral, radio) = air.join(name);
        let coordinator =
            BleCoordinator::new(fast_ble(), Arc::new(central), Arc::new(peripheral), radio);
        let identity = Arc::new(
            IdentityManager::from_provider(&EphemeralIdentity, name).expect("ephemeral identity"),
        );
        let engine = ProtocolEngine::new(
            EngineConfig {
                ble: fast_ble(),
                ..config
            },
            identity,
            Arc::new(PeerDirectory::new()),
            Arc::new(coordinator),
        );
        let (delegate, events) = ChannelDelegate::new();
        engine.set_delegate(Some(Arc::new(delegate)));
        Self {
            name: name.to_string(),
            engine,
            events,
        }
    }

    pub async fn start(&self) {
        assert!(self.engine.initialize(), "{} failed to initialize", self.name);
        self.engine.start().await.expect("engine start");
    }

    pub fn key(&self) -> PeerKey {
        self.engine.identity().public_key()
    }

    /// Next event matching `pred`, skipping the rest
    pub async fn wait_for(&mut self, pred: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("{} timed out waiting for event", self.name))
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_connected(&mut self, peer: PeerKey) {
        self.wait_for(|e| matches!(e, MeshEvent::PeerConnected(p) if p.public_key == peer))
            .await;
    }

    pub async fn wait_message(&mut self) -> (PeerKey, Vec<u8>) {
        match self
            .wait_for(|e| matches!(e, MeshEvent::MessageReceived { .. }))
            .await
        {
            MeshEvent::MessageReceived { sender, payload } => (sender, payload),
            _ => unreachable!(),
        }
    }
}

/// Start `a` and `b` on the same air and wait for the handshake both ways
pub async fn linked_pair(air: &LoopbackAir, a: &str, b: &str) -> (Node, Node) {
    let mut a = Node::join(air, a);
    let mut b = Node::join(air, b);
    a.start().await;
    b.start().await;
    a.wait_connected(b.key()).await;
    b.wait_connected(a.key()).await;
    (a, b)
}
