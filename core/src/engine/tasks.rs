// Periodic engine work: re-ANNOUNCE + stale sweep, fragment session reaper

use super::EngineInner;
use crate::protocol::{NackPayload, NackReason, PacketType};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

/// Upper bound on how often expired reassembly sessions are looked for
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

pub(super) async fn run_announcer(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.announce_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; fresh links already got a handshake
    ticker.tick().await;

    loop {
        ticker.tick().await;
        inner.broadcast_announce().await;
        inner.sweep_stale();
    }
}

pub(super) async fn run_fragment_reaper(inner: Arc<EngineInner>) {
    let period = REAPER_INTERVAL.min(inner.config.reassembly_timeout());
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let expired = inner.assembler.lock().cleanup_expired();
        for session in expired {
            debug!(
                "Reassembly from {} timed out with {}/{} fragments after {:?}",
                session.sender.short(),
                session.received,
                session.total,
                session.age
            );
            if !inner.transport.is_reachable(&session.sender) {
                continue;
            }
            let nack = NackPayload {
                message_id: Uuid::from_bytes(session.message_id),
                reason: NackReason::ReassemblyTimeout,
            };
            inner
                .send_receipt(PacketType::Nack, session.sender, nack.encode())
                .await;
        }
    }
}
