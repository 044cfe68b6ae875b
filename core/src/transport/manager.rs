//! Transport Manager - multiplexes multiple transport channels
//!
//! The engine talks to a single `TransportChannel`. When the host supplies
//! more than one link layer (BLE plus a network transport, say), the manager
//! stands in front of them: sends go to the first channel that reports the
//! peer reachable, address-based sends go to the channel owning that address
//! type, and broadcasts fan out to all of them.

use crate::protocol::PeerKey;
use crate::transport::abstraction::{
    LinkAddress, LocalAdvertisement, TransportChannel, TransportError, TransportEventSender,
    TransportType,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered set of transport channels
pub struct TransportManager {
    /// Channels in preference order
    channels: RwLock<Vec<Arc<dyn TransportChannel>>>,
}

impl TransportManager {
    /// Create an empty transport manager
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Register a channel; earlier registrations win when several can reach a peer
    pub fn register(&self, channel: Arc<dyn TransportChannel>) {
        info!("Transport registered: {}", channel.transport_type());
        self.channels.write().push(channel);
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// First channel able to reach `peer`
    pub fn channel_for_peer(&self, peer: &PeerKey) -> Option<Arc<dyn TransportChannel>> {
        self.channels
            .read()
            .iter()
            .find(|channel| channel.is_reachable(peer))
            .cloned()
    }

    /// Channel that owns addresses of this transport type
    pub fn channel_for_address(&self, address: &LinkAddress) -> Option<Arc<dyn TransportChannel>> {
        self.channels
            .read()
            .iter()
            .find(|channel| channel.transport_type() == address.transport)
            .cloned()
    }

    /// Transport types currently able to reach `peer`
    pub fn transports_for_peer(&self, peer: &PeerKey) -> Vec<TransportType> {
        self.channels
            .read()
            .iter()
            .filter(|channel| channel.is_reachable(peer))
            .map(|channel| channel.transport_type())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransportChannel>> {
        self.channels.read().clone()
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportChannel for TransportManager {
    /// Type of the preferred (first registered) channel
    fn transport_type(&self) -> TransportType {
        self.channels
            .read()
            .first()
            .map(|channel| channel.transport_type())
            .unwrap_or(TransportType::Local)
    }

    /// Starts every channel; succeeds if at least one comes up
    async fn start(
        &self,
        advertisement: &LocalAdvertisement,
        events: TransportEventSender,
    ) -> Result<(), TransportError> {
        let channels = self.snapshot();
        if channels.is_empty() {
            return Err(TransportError::TransportNotAvailable(
                "no transports registered".to_string(),
            ));
        }

        let mut started = 0;
        let mut last_error = None;
        for channel in channels {
            match channel.start(advertisement, events.clone()).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!("Transport {} failed to start: {}", channel.transport_type(), e);
                    last_error = Some(e);
                }
            }
        }

        match (started, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn stop(&self) {
        for channel in self.snapshot() {
            channel.stop().await;
        }
    }

    async fn send(&self, peer: &PeerKey, data: &[u8]) -> Result<(), TransportError> {
        let channel = self
            .channel_for_peer(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.short()))?;
        debug!("Sending {} bytes to {} via {}", data.len(), peer.short(), channel.transport_type());
        channel.send(peer, data).await
    }

    async fn send_to_address(
        &self,
        address: &LinkAddress,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let channel = self
            .channel_for_address(address)
            .ok_or_else(|| TransportError::TransportNotAvailable(address.transport.to_string()))?;
        channel.send_to_address(address, data).await
    }

    async fn broadcast(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut delivered = 0;
        for channel in self.snapshot() {
            match channel.broadcast(data).await {
                Ok(count) => delivered += count,
                Err(e) => warn!("Broadcast on {} failed: {}", channel.transport_type(), e),
            }
        }
        Ok(delivered)
    }

    fn is_reachable(&self, peer: &PeerKey) -> bool {
        self.channel_for_peer(peer).is_some()
    }

    fn associate(&self, address: &LinkAddress, peer: PeerKey) {
        if let Some(channel) = self.channel_for_address(address) {
            channel.associate(address, peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::MockTransportChannel;
    use tokio::sync::mpsc;

    fn key(val: u8) -> PeerKey {
        PeerKey([val; 32])
    }

    fn advertisement() -> LocalAdvertisement {
        LocalAdvertisement {
            public_key: key(9),
            service_uuid: uuid::Uuid::nil(),
            nickname: "me".to_string(),
        }
    }

    fn mock(transport: TransportType, reachable: Option<PeerKey>) -> MockTransportChannel {
        let mut channel = MockTransportChannel::new();
        channel.expect_transport_type().return_const(transport);
        channel
            .expect_is_reachable()
            .returning(move |peer| Some(*peer) == reachable);
        channel
    }

    #[test]
    fn test_manager_creation() {
        let manager = TransportManager::new();
        assert!(manager.is_empty());
        assert_eq!(manager.transport_type(), TransportType::Local);
        assert!(!manager.is_reachable(&key(1)));
    }

    #[tokio::test]
    async fn test_send_picks_first_reachable_channel() {
        let ble = mock(TransportType::BLE, None);
        let mut net = mock(TransportType::Internet, Some(key(1)));
        net.expect_send()
            .withf(|peer, data| *peer == PeerKey([1; 32]) && data == b"hi")
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = TransportManager::new();
        manager.register(Arc::new(ble));
        manager.register(Arc::new(net));

        assert_eq!(manager.transports_for_peer(&key(1)), vec![TransportType::Internet]);
        manager.send(&key(1), b"hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_unreachable() {
        let manager = TransportManager::new();
        manager.register(Arc::new(mock(TransportType::BLE, None)));
        assert!(matches!(
            manager.send(&key(2), b"x").await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_address_routes_by_type() {
        let mut ble = mock(TransportType::BLE, None);
        ble.expect_send_to_address().times(1).returning(|_, _| Ok(()));
        let net = mock(TransportType::Internet, None);

        let manager = TransportManager::new();
        manager.register(Arc::new(net));
        manager.register(Arc::new(ble));

        manager
            .send_to_address(&LinkAddress::ble("dev"), b"a")
            .await
            .unwrap();
        assert!(manager
            .send_to_address(&LinkAddress::new(TransportType::Local, "x"), b"a")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_sums_and_tolerates_failures() {
        let mut ble = mock(TransportType::BLE, None);
        ble.expect_broadcast().returning(|_| Ok(2));
        let mut net = mock(TransportType::Internet, None);
        net.expect_broadcast()
            .returning(|_| Err(TransportError::Radio("off".to_string())));
        let mut local = mock(TransportType::Local, None);
        local.expect_broadcast().returning(|_| Ok(1));

        let manager = TransportManager::new();
        manager.register(Arc::new(ble));
        manager.register(Arc::new(net));
        manager.register(Arc::new(local));

        assert_eq!(manager.broadcast(b"all").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_start_succeeds_if_any_channel_starts() {
        let mut ble = mock(TransportType::BLE, None);
        ble.expect_start()
            .returning(|_, _| Err(TransportError::Radio("powered off".to_string())));
        let mut net = mock(TransportType::Internet, None);
        net.expect_start().returning(|_, _| Ok(()));

        let manager = TransportManager::new();
        manager.register(Arc::new(ble));
        manager.register(Arc::new(net));

        let (tx, _rx) = mpsc::channel(8);
        manager.start(&advertisement(), tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_if_all_fail() {
        let mut ble = mock(TransportType::BLE, None);
        ble.expect_start()
            .returning(|_, _| Err(TransportError::Radio("powered off".to_string())));

        let manager = TransportManager::new();
        manager.register(Arc::new(ble));

        let (tx, _rx) = mpsc::channel(8);
        assert!(manager.start(&advertisement(), tx).await.is_err());
    }

    #[test]
    fn test_associate_forwards_to_owner() {
        let mut ble = mock(TransportType::BLE, None);
        ble.expect_associate()
            .withf(|addr, peer| addr.id == "dev" && *peer == PeerKey([4; 32]))
            .times(1)
            .return_const(());

        let manager = TransportManager::new();
        manager.register(Arc::new(ble));
        manager.associate(&LinkAddress::ble("dev"), key(4));
    }
}
