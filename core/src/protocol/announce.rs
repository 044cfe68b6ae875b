// ANNOUNCE payload - TLV identity record sent on every fresh connection
//
// Each field is [1 byte type][1 byte length][value]. Unknown types are
// skipped so newer peers can add fields without breaking older ones.

use super::{PeerKey, ProtocolError, PUBLIC_KEY_LEN};

const TLV_NICKNAME: u8 = 0x01;
const TLV_PUBLIC_KEY: u8 = 0x02;
const TLV_PROTOCOL_VERSION: u8 = 0x03;

/// Maximum nickname length in bytes (one TLV length byte)
pub const MAX_NICKNAME_LEN: usize = u8::MAX as usize;

/// Identity record carried by an `Announce` packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub public_key: PeerKey,
    pub protocol_version: u8,
    pub nickname: String,
}

impl AnnouncePayload {
    pub fn new(public_key: PeerKey, protocol_version: u8, nickname: impl Into<String>) -> Self {
        Self {
            public_key,
            protocol_version,
            nickname: nickname.into(),
        }
    }

    /// Encode to TLV bytes. Nicknames longer than 255 bytes are cut at the
    /// last char boundary that fits.
    pub fn encode(&self) -> Vec<u8> {
        let nickname = truncate_utf8(&self.nickname, MAX_NICKNAME_LEN);

        let mut buf = Vec::with_capacity(6 + PUBLIC_KEY_LEN + nickname.len());
        buf.push(TLV_NICKNAME);
        buf.push(nickname.len() as u8);
        buf.extend_from_slice(nickname.as_bytes());

        buf.push(TLV_PUBLIC_KEY);
        buf.push(PUBLIC_KEY_LEN as u8);
        buf.extend_from_slice(self.public_key.as_bytes());

        buf.push(TLV_PROTOCOL_VERSION);
        buf.push(1);
        buf.push(self.protocol_version);
        buf
    }

    /// Decode from untrusted TLV bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut nickname = None;
        let mut public_key = None;
        let mut protocol_version = None;

        let mut cursor = 0;
        while cursor < data.len() {
            if cursor + 2 > data.len() {
                return Err(ProtocolError::Format("truncated TLV header".to_string()));
            }
            let tlv_type = data[cursor];
            let len = data[cursor + 1] as usize;
            let start = cursor + 2;
            let end = start + len;
            if end > data.len() {
                return Err(ProtocolError::Format(format!(
                    "TLV 0x{tlv_type:02x} declares {len} bytes past end of payload"
                )));
            }
            let value = &data[start..end];

            match tlv_type {
                TLV_NICKNAME => {
                    let text = std::str::from_utf8(value)
                        .map_err(|_| ProtocolError::Format("nickname is not UTF-8".to_string()))?;
                    nickname = Some(text.to_string());
                }
                TLV_PUBLIC_KEY => {
                    public_key = Some(
                        PeerKey::from_slice(value)
                            .map_err(|e| ProtocolError::Format(e.to_string()))?,
                    );
                }
                TLV_PROTOCOL_VERSION => {
                    if len != 1 {
                        return Err(ProtocolError::Format(
                            "protocol version TLV must be 1 byte".to_string(),
                        ));
                    }
                    protocol_version = Some(value[0]);
                }
                _ => {}
            }
            cursor = end;
        }

        Ok(Self {
            public_key: public_key
                .ok_or_else(|| ProtocolError::Format("announce missing public key".to_string()))?,
            protocol_version: protocol_version.ok_or_else(|| {
                ProtocolError::Format("announce missing protocol version".to_string())
            })?,
            nickname: nickname.unwrap_or_default(),
        })
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
