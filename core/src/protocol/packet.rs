/// Mesh packet - the 152-byte fixed header format carried over BLE
///
/// Format (all integers big-endian):
/// [1 byte]   packet type
/// [1 byte]   ttl (0-7)
/// [4 bytes]  timestamp (seconds since Unix epoch)
/// [32 bytes] sender public key
/// [32 bytes] recipient public key (all zero = broadcast)
/// [2 bytes]  payload length
/// [16 bytes] packet id (UUID)
/// [64 bytes] Ed25519 signature
/// [N bytes]  payload

use super::{unix_timestamp, PeerKey, ProtocolError, PUBLIC_KEY_LEN};
use uuid::Uuid;

/// Fixed header size preceding the payload
pub const HEADER_SIZE: usize = 152;

/// Highest legal ttl value
pub const MAX_TTL: u8 = 7;

/// Largest payload the 2-byte length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

const OFFSET_TYPE: usize = 0;
const OFFSET_TTL: usize = 1;
const OFFSET_TIMESTAMP: usize = 2;
const OFFSET_SENDER: usize = 6;
const OFFSET_RECIPIENT: usize = 38;
const OFFSET_PAYLOAD_LEN: usize = 70;
const OFFSET_PACKET_ID: usize = 72;
const OFFSET_SIGNATURE: usize = 88;

/// Packet type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Identity handshake (0x01), never relayed
    Announce = 0x01,
    /// Single-packet application payload (0x02)
    Message = 0x02,
    /// First fragment of an oversized payload (0x03)
    FragmentStart = 0x03,
    /// Middle fragment (0x04)
    FragmentContinue = 0x04,
    /// Final fragment (0x05)
    FragmentEnd = 0x05,
    /// Delivery acknowledgement (0x06)
    Ack = 0x06,
    /// Negative acknowledgement (0x07)
    Nack = 0x07,
}

impl PacketType {
    /// Convert from u8 to PacketType
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x02 => Ok(PacketType::Message),
            0x03 => Ok(PacketType::FragmentStart),
            0x04 => Ok(PacketType::FragmentContinue),
            0x05 => Ok(PacketType::FragmentEnd),
            0x06 => Ok(PacketType::Ack),
            0x07 => Ok(PacketType::Nack),
            other => Err(ProtocolError::Format(format!("unknown packet type 0x{other:02x}"))),
        }
    }

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_fragment(&self) -> bool {
        matches!(
            self,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd
        )
    }
}

/// A decoded (or about-to-be-encoded) mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    ttl: u8,
    pub timestamp: u32,
    pub sender: PeerKey,
    pub recipient: PeerKey,
    pub packet_id: Uuid,
    pub signature: [u8; SIGNATURE_LEN],
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build an unsigned packet with a fresh v4 packet id and the current time.
    ///
    /// `recipient: None` addresses the packet to every peer.
    pub fn new(
        packet_type: PacketType,
        ttl: u8,
        sender: PeerKey,
        recipient: Option<PeerKey>,
        payload: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if ttl > MAX_TTL {
            return Err(ProtocolError::Argument(format!(
                "ttl {ttl} exceeds maximum {MAX_TTL}"
            )));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Argument(format!(
                "payload of {} bytes exceeds maximum {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if sender.is_broadcast() {
            return Err(ProtocolError::Argument(
                "sender key cannot be the broadcast key".to_string(),
            ));
        }

        Ok(Self {
            packet_type,
            ttl,
            timestamp: unix_timestamp(),
            sender,
            recipient: recipient.unwrap_or(PeerKey::BROADCAST),
            packet_id: Uuid::new_v4(),
            signature: [0u8; SIGNATURE_LEN],
            payload,
        })
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_broadcast()
    }

    /// True when `key` is the explicit recipient or the packet is a broadcast
    pub fn is_addressed_to(&self, key: &PeerKey) -> bool {
        self.is_broadcast() || self.recipient == *key
    }

    pub fn is_signed(&self) -> bool {
        self.signature != [0u8; SIGNATURE_LEN]
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the packet to its wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());

        buf.push(self.packet_type.as_u8());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        // Packet::new and deserialize both bound the payload to u16::MAX
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.packet_id.as_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.payload);

        debug_assert_eq!(buf.len(), self.encoded_len());
        buf
    }

    /// Deserialize a packet from untrusted bytes.
    ///
    /// Returns `ProtocolError::Format` if:
    /// - Buffer shorter than the fixed header
    /// - Unknown packet type or ttl above 7
    /// - Declared payload length exceeds the remaining buffer
    ///
    /// Bytes past the declared payload are ignored; some BLE stacks pad writes.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Format(format!(
                "buffer too short: need {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }

        let packet_type = PacketType::from_u8(data[OFFSET_TYPE])?;

        let ttl = data[OFFSET_TTL];
        if ttl > MAX_TTL {
            return Err(ProtocolError::Format(format!("ttl {ttl} out of range")));
        }

        let timestamp = u32::from_be_bytes(read_array(data, OFFSET_TIMESTAMP));
        let sender = PeerKey(read_array::<PUBLIC_KEY_LEN>(data, OFFSET_SENDER));
        let recipient = PeerKey(read_array::<PUBLIC_KEY_LEN>(data, OFFSET_RECIPIENT));
        let payload_len = u16::from_be_bytes(read_array(data, OFFSET_PAYLOAD_LEN)) as usize;
        let packet_id = Uuid::from_bytes(read_array(data, OFFSET_PACKET_ID));
        let signature = read_array::<SIGNATURE_LEN>(data, OFFSET_SIGNATURE);

        let remaining = data.len() - HEADER_SIZE;
        if payload_len > remaining {
            return Err(ProtocolError::Format(format!(
                "declared payload length {payload_len} exceeds remaining {remaining} bytes"
            )));
        }

        Ok(Self {
            packet_type,
            ttl,
            timestamp,
            sender,
            recipient,
            packet_id,
            signature,
            payload: data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        })
    }

    /// Wire bytes with the signature region zeroed: the exact input to
    /// both signing and verification.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = self.serialize();
        buf[OFFSET_SIGNATURE..OFFSET_SIGNATURE + SIGNATURE_LEN].fill(0);
        buf
    }

    /// Copy of this packet with ttl reduced by one and the same packet id
    pub fn decrement_ttl(&self) -> Result<Packet, ProtocolError> {
        if self.ttl == 0 {
            return Err(ProtocolError::InvalidState(
                "cannot decrement ttl below zero".to_string(),
            ));
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Ok(next)
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}
