// Delivery receipts - ACK and NACK payloads
//
// ACK:  [16 bytes acknowledged id]
// NACK: [16 bytes message id][1 byte reason]
//
// The id is the packet id of a single Message, or the fragment message id
// of a fragmented one.

use super::ProtocolError;
use uuid::Uuid;

const ID_LEN: usize = 16;

/// Why a message could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackReason {
    /// Not every fragment arrived before the reassembly timeout
    ReassemblyTimeout,
    /// Reason code this version does not know
    Other(u8),
}

impl NackReason {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => NackReason::ReassemblyTimeout,
            other => NackReason::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            NackReason::ReassemblyTimeout => 0x01,
            NackReason::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for NackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NackReason::ReassemblyTimeout => write!(f, "reassembly timeout"),
            NackReason::Other(code) => write!(f, "reason 0x{code:02x}"),
        }
    }
}

/// Payload of an `Ack` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub message_id: Uuid,
}

impl AckPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.message_id.as_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_id: read_id(data, "ACK")?,
        })
    }
}

/// Payload of a `Nack` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackPayload {
    pub message_id: Uuid,
    pub reason: NackReason,
}

impl NackPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ID_LEN + 1);
        buf.extend_from_slice(self.message_id.as_bytes());
        buf.push(self.reason.as_u8());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let message_id = read_id(data, "NACK")?;
        let code = *data
            .get(ID_LEN)
            .ok_or_else(|| ProtocolError::Format("NACK missing reason byte".to_string()))?;
        Ok(Self {
            message_id,
            reason: NackReason::from_u8(code),
        })
    }
}

fn read_id(data: &[u8], kind: &str) -> Result<Uuid, ProtocolError> {
    let bytes: [u8; ID_LEN] = data
        .get(..ID_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| {
            ProtocolError::Format(format!("{kind} payload of {} bytes is too short", data.len()))
        })?;
    Ok(Uuid::from_bytes(bytes))
}
