/// Fragmentation and reassembly for payloads above the single-packet threshold
///
/// Every fragment payload starts with a fixed header so any fragment can open
/// a reassembly session, whatever order the radio delivers them in:
/// [16 bytes] message id
/// [2 bytes]  fragment index (BE u16)
/// [2 bytes]  total fragments (BE u16)
/// [4 bytes]  total reassembled size (BE u32)
/// [N bytes]  chunk data (≤ FRAGMENT_CHUNK_SIZE)

use super::packet::{Packet, PacketType};
use super::{PeerKey, ProtocolError};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Payloads strictly larger than this are fragmented
pub const FRAGMENT_THRESHOLD: usize = 500;

/// Maximum chunk data per fragment
pub const FRAGMENT_CHUNK_SIZE: usize = 450;

/// Sender-side pause between consecutive fragments
pub const FRAGMENT_DELAY: Duration = Duration::from_millis(20);

/// Idle time after which an incomplete session is discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on simultaneously open sessions
pub const MAX_CONCURRENT_SESSIONS: usize = 64;

/// Upper bound on a reassembled payload (1 MiB)
pub const MAX_REASSEMBLED_SIZE: usize = 1024 * 1024;

/// Fragment header: [message_id: 16 | index: u16 | total: u16 | total_size: u32]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: [u8; 16],
    pub index: u16,
    pub total: u16,
    pub total_size: u32,
}

impl FragmentHeader {
    /// Size of fragment header in bytes
    pub const HEADER_SIZE: usize = 24;

    pub fn new(
        message_id: [u8; 16],
        index: u16,
        total: u16,
        total_size: u32,
    ) -> Result<Self, ProtocolError> {
        if total == 0 {
            return Err(ProtocolError::Argument("fragment total must be > 0".to_string()));
        }
        if index >= total {
            return Err(ProtocolError::Argument(format!(
                "fragment index {index} out of range for total {total}"
            )));
        }
        Ok(Self {
            message_id,
            index,
            total,
            total_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::HEADER_SIZE] {
        let mut bytes = [0u8; Self::HEADER_SIZE];
        bytes[0..16].copy_from_slice(&self.message_id);
        bytes[16..18].copy_from_slice(&self.index.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.total.to_be_bytes());
        bytes[20..24].copy_from_slice(&self.total_size.to_be_bytes());
        bytes
    }

    /// Parse the header at the front of a fragment payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Format(format!(
                "fragment header too short: {} bytes",
                bytes.len()
            )));
        }
        let mut message_id = [0u8; 16];
        message_id.copy_from_slice(&bytes[0..16]);
        let index = u16::from_be_bytes([bytes[16], bytes[17]]);
        let total = u16::from_be_bytes([bytes[18], bytes[19]]);
        let total_size = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Self::new(message_id, index, total, total_size)
            .map_err(|e| ProtocolError::Format(e.to_string()))
    }

    /// Which fragment packet type carries this index
    pub fn packet_type(&self) -> PacketType {
        if self.index == 0 {
            PacketType::FragmentStart
        } else if self.index + 1 == self.total {
            PacketType::FragmentEnd
        } else {
            PacketType::FragmentContinue
        }
    }
}

/// Buffered state of one in-flight fragmented message
#[derive(Debug)]
struct FragmentSession {
    total: u16,
    total_size: u32,
    sender: PeerKey,
    chunks: BTreeMap<u16, Vec<u8>>,
    buffered_bytes: usize,
    started_at: Instant,
    last_activity: Instant,
}

impl FragmentSession {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }
}

/// Incomplete session dropped by `cleanup_expired`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredFragmentSession {
    pub message_id: [u8; 16],
    pub sender: PeerKey,
    pub received: usize,
    pub total: u16,
    pub age: Duration,
}

/// Splits oversized payloads into fragment packets and rebuilds them on receipt
pub struct FragmentAssembler {
    threshold: usize,
    chunk_size: usize,
    timeout: Duration,
    sessions: HashMap<[u8; 16], FragmentSession>,
    /// Completed or expired message ids; late fragments for these are dropped
    tombstones: HashMap<[u8; 16], Instant>,
}

impl FragmentAssembler {
    /// Create an assembler with the protocol defaults (500 / 450 / 30 s)
    pub fn new() -> Self {
        Self {
            threshold: FRAGMENT_THRESHOLD,
            chunk_size: FRAGMENT_CHUNK_SIZE,
            timeout: REASSEMBLY_TIMEOUT,
            sessions: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// Create an assembler with custom limits
    pub fn with_limits(
        threshold: usize,
        chunk_size: usize,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        if chunk_size == 0 || chunk_size > threshold {
            return Err(ProtocolError::Argument(format!(
                "chunk size {chunk_size} must be in 1..={threshold}"
            )));
        }
        if timeout.is_zero() {
            return Err(ProtocolError::Argument("reassembly timeout must be > 0".to_string()));
        }
        Ok(Self {
            threshold,
            chunk_size,
            timeout,
            ..Self::new()
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn needs_fragmentation(&self, payload: &[u8]) -> bool {
        payload.len() > self.threshold
    }

    /// Number of sessions currently buffering
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Split a payload into unsigned fragment packets in index order
    pub fn fragment(
        &self,
        payload: &[u8],
        sender: PeerKey,
        recipient: Option<PeerKey>,
        ttl: u8,
    ) -> Result<Vec<Packet>, ProtocolError> {
        if payload.len() > MAX_REASSEMBLED_SIZE {
            return Err(ProtocolError::Argument(format!(
                "payload of {} bytes exceeds fragmentation limit {}",
                payload.len(),
                MAX_REASSEMBLED_SIZE
            )));
        }

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.chunk_size).collect()
        };

        let total = u16::try_from(chunks.len()).map_err(|_| {
            ProtocolError::Argument("payload needs more than 65535 fragments".to_string())
        })?;
        let message_id = *Uuid::new_v4().as_bytes();

        let mut packets = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let header =
                FragmentHeader::new(message_id, index as u16, total, payload.len() as u32)?;
            let mut body = Vec::with_capacity(FragmentHeader::HEADER_SIZE + chunk.len());
            body.extend_from_slice(&header.to_bytes());
            body.extend_from_slice(chunk);
            packets.push(Packet::new(header.packet_type(), ttl, sender, recipient, body)?);
        }

        Ok(packets)
    }

    /// Buffer a fragment packet; returns the reassembled payload exactly once,
    /// when the last missing index arrives.
    pub fn process_fragment(&mut self, packet: &Packet) -> Option<Vec<u8>> {
        if !packet.packet_type.is_fragment() {
            return None;
        }

        let header = match FragmentHeader::from_bytes(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping malformed fragment from {}: {}", packet.sender.short(), e);
                return None;
            }
        };
        let chunk = &packet.payload[FragmentHeader::HEADER_SIZE..];
        let now = Instant::now();

        if self.tombstones.contains_key(&header.message_id) {
            debug!("Dropping fragment for finished message {}", hex::encode(header.message_id));
            return None;
        }

        if header.total_size as usize > MAX_REASSEMBLED_SIZE {
            debug!("Dropping fragment with impossible size {}", header.total_size);
            return None;
        }

        if !self.sessions.contains_key(&header.message_id) {
            if self.sessions.len() >= MAX_CONCURRENT_SESSIONS {
                self.evict_oldest();
            }
            self.sessions.insert(
                header.message_id,
                FragmentSession {
                    total: header.total,
                    total_size: header.total_size,
                    sender: packet.sender,
                    chunks: BTreeMap::new(),
                    buffered_bytes: 0,
                    started_at: now,
                    last_activity: now,
                },
            );
        }

        let session = self.sessions.get_mut(&header.message_id)?;

        if session.sender != packet.sender {
            debug!(
                "Dropping fragment: sender {} does not own session",
                packet.sender.short()
            );
            return None;
        }
        if session.total != header.total || session.total_size != header.total_size {
            debug!("Dropping fragment with inconsistent totals");
            return None;
        }
        if session.chunks.contains_key(&header.index) {
            return None;
        }
        if session.buffered_bytes + chunk.len() > session.total_size as usize {
            debug!("Dropping fragment overflowing declared size");
            return None;
        }

        session.buffered_bytes += chunk.len();
        session.chunks.insert(header.index, chunk.to_vec());
        session.last_activity = now;

        if !session.is_complete() {
            return None;
        }

        let session = self.sessions.remove(&header.message_id)?;
        self.tombstones.insert(header.message_id, now);

        let mut assembled = Vec::with_capacity(session.total_size as usize);
        for chunk in session.chunks.into_values() {
            assembled.extend_from_slice(&chunk);
        }

        if assembled.len() != session.total_size as usize {
            debug!(
                "Reassembled {} bytes but {} were declared; dropping",
                assembled.len(),
                session.total_size
            );
            return None;
        }

        Some(assembled)
    }

    /// Remove sessions idle past the timeout and forget old tombstones
    pub fn cleanup_expired(&mut self) -> Vec<ExpiredFragmentSession> {
        let now = Instant::now();
        let timeout = self.timeout;

        let expired_ids: Vec<[u8; 16]> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(session) = self.sessions.remove(&id) {
                self.tombstones.insert(id, now);
                expired.push(ExpiredFragmentSession {
                    message_id: id,
                    sender: session.sender,
                    received: session.chunks.len(),
                    total: session.total,
                    age: now.duration_since(session.started_at),
                });
            }
        }

        self.tombstones
            .retain(|_, at| now.duration_since(*at) < timeout);

        expired
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|(_, s)| s.last_activity)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            debug!("Session limit reached, evicting {}", hex::encode(id));
            self.sessions.remove(&id);
            self.tombstones.insert(id, Instant::now());
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> PeerKey {
        PeerKey([0x42; 32])
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_needs_fragmentation_threshold() {
        let assembler = FragmentAssembler::new();
        assert!(!assembler.needs_fragmentation(&payload(FRAGMENT_THRESHOLD)));
        assert!(assembler.needs_fragmentation(&payload(FRAGMENT_THRESHOLD + 1)));
    }

    #[test]
    fn test_fragment_header_roundtrip() {
        let header = FragmentHeader::new([9; 16], 2, 5, 1234).unwrap();
        assert_eq!(FragmentHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        assert!(FragmentHeader::new([9; 16], 5, 5, 1).is_err());
        assert!(FragmentHeader::new([9; 16], 0, 0, 1).is_err());
    }

    #[test]
    fn test_fragment_types_and_sizes() {
        let assembler = FragmentAssembler::new();
        let packets = assembler
            .fragment(&payload(1000), sender(), None, 7)
            .unwrap();

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].packet_type, PacketType::FragmentStart);
        assert_eq!(packets[1].packet_type, PacketType::FragmentContinue);
        assert_eq!(packets[2].packet_type, PacketType::FragmentEnd);
        for packet in &packets {
            assert!(packet.payload.len() <= FragmentHeader::HEADER_SIZE + FRAGMENT_CHUNK_SIZE);
            assert!(packet.payload.len() <= FRAGMENT_THRESHOLD);
        }
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        let mut assembler = FragmentAssembler::new();
        let packets = assembler.fragment(&[], sender(), None, 3).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::FragmentStart);
        assert_eq!(assembler.process_fragment(&packets[0]), Some(Vec::new()));
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let mut assembler = FragmentAssembler::new();
        let data = payload(2000);
        let packets = assembler.fragment(&data, sender(), None, 7).unwrap();

        let mut results = Vec::new();
        for packet in packets.iter().rev() {
            if let Some(out) = assembler.process_fragment(packet) {
                results.push(out);
            }
        }
        assert_eq!(results, vec![data]);
        assert_eq!(assembler.active_sessions(), 0);
    }

    #[test]
    fn test_duplicate_fragments_deliver_once() {
        let mut assembler = FragmentAssembler::new();
        let data = payload(950);
        let packets = assembler.fragment(&data, sender(), None, 7).unwrap();

        let mut delivered = 0;
        for packet in packets.iter().chain(packets.iter()) {
            if assembler.process_fragment(packet).is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_foreign_sender_cannot_join_session() {
        let mut assembler = FragmentAssembler::new();
        let packets = assembler.fragment(&payload(900), sender(), None, 7).unwrap();

        assert!(assembler.process_fragment(&packets[0]).is_none());

        let mut spoofed = packets[1].clone();
        spoofed.sender = PeerKey([0x99; 32]);
        assert!(assembler.process_fragment(&spoofed).is_none());
        assert_eq!(assembler.active_sessions(), 1);

        assert!(assembler.process_fragment(&packets[1]).is_some());
    }

    #[test]
    fn test_non_fragment_packet_ignored() {
        let mut assembler = FragmentAssembler::new();
        let packet = Packet::new(PacketType::Message, 1, sender(), None, payload(30)).unwrap();
        assert!(assembler.process_fragment(&packet).is_none());
        assert_eq!(assembler.active_sessions(), 0);
    }

    #[test]
    fn test_with_limits_validation() {
        assert!(FragmentAssembler::with_limits(500, 0, REASSEMBLY_TIMEOUT).is_err());
        assert!(FragmentAssembler::with_limits(500, 501, REASSEMBLY_TIMEOUT).is_err());
        assert!(FragmentAssembler::with_limits(500, 450, Duration::ZERO).is_err());
        assert!(FragmentAssembler::with_limits(200, 100, REASSEMBLY_TIMEOUT).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_after_timeout() {
        let mut assembler = FragmentAssembler::new();
        let packets = assembler.fragment(&payload(1400), sender(), None, 7).unwrap();

        assembler.process_fragment(&packets[0]);
        assembler.process_fragment(&packets[1]);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(assembler.cleanup_expired().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = assembler.cleanup_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].received, 2);
        assert_eq!(expired[0].total, 4);
        assert_eq!(expired[0].sender, sender());

        // Late fragments of an expired message never complete it
        assert!(assembler.process_fragment(&packets[2]).is_none());
        assert!(assembler.process_fragment(&packets[3]).is_none());
        assert_eq!(assembler.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_extends_session() {
        let mut assembler = FragmentAssembler::new();
        let data = payload(1400);
        let packets = assembler.fragment(&data, sender(), None, 7).unwrap();

        for packet in &packets[..3] {
            assembler.process_fragment(packet);
            tokio::time::advance(Duration::from_secs(20)).await;
            assert!(assembler.cleanup_expired().is_empty());
        }
        assert_eq!(assembler.process_fragment(&packets[3]), Some(data));
    }
}
