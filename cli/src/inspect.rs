// Human-readable breakdown of a raw mesh packet

use anyhow::{Context, Result};
use meshwire_core::protocol::{AckPayload, FragmentHeader, NackPayload};
use meshwire_core::{AnnouncePayload, IdentityKeys, Packet, PacketType};

const PREVIEW_BYTES: usize = 48;

/// Parse hex, tolerating whitespace and a `0x` prefix
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    hex::decode(cleaned).context("Input is not valid hex")
}

/// Decode `bytes` as a packet and describe every field
pub fn describe(bytes: &[u8]) -> Result<Vec<(&'static str, String)>> {
    let packet = Packet::deserialize(bytes).context("Not a mesh packet")?;

    let signature = if !packet.is_signed() {
        "unsigned".to_string()
    } else if IdentityKeys::verify(&packet) {
        "valid".to_string()
    } else {
        "INVALID".to_string()
    };
    let recipient = if packet.is_broadcast() {
        "broadcast".to_string()
    } else {
        packet.recipient.to_hex()
    };

    let mut fields = vec![
        ("type", format!("{:?}", packet.packet_type)),
        ("ttl", packet.ttl().to_string()),
        ("timestamp", packet.timestamp.to_string()),
        ("sender", packet.sender.to_hex()),
        ("recipient", recipient),
        ("packet id", packet.packet_id.to_string()),
        ("payload", format!("{} bytes", packet.payload.len())),
        ("signature", signature),
    ];

    match packet.packet_type {
        PacketType::Announce => match AnnouncePayload::decode(&packet.payload) {
            Ok(announce) => {
                fields.push(("nickname", announce.nickname.clone()));
                fields.push(("version", announce.protocol_version.to_string()));
                let matches = announce.public_key == packet.sender;
                fields.push(("key matches sender", matches.to_string()));
            }
            Err(e) => fields.push(("announce", format!("malformed: {e}"))),
        },
        PacketType::Message => fields.push(("content", preview(&packet.payload))),
        PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => {
            match FragmentHeader::from_bytes(&packet.payload) {
                Ok(header) => {
                    fields.push(("message id", hex::encode(header.message_id)));
                    fields.push((
                        "fragment",
                        format!("{} of {}", header.index + 1, header.total),
                    ));
                    fields.push(("total size", header.total_size.to_string()));
                }
                Err(e) => fields.push(("fragment", format!("malformed: {e}"))),
            }
        }
        PacketType::Ack => match AckPayload::decode(&packet.payload) {
            Ok(ack) => fields.push(("acknowledges", ack.message_id.to_string())),
            Err(e) => fields.push(("ack", format!("malformed: {e}"))),
        },
        PacketType::Nack => match NackPayload::decode(&packet.payload) {
            Ok(nack) => {
                fields.push(("rejects", nack.message_id.to_string()));
                fields.push(("reason", nack.reason.to_string()));
            }
            Err(e) => fields.push(("nack", format!("malformed: {e}"))),
        },
    }

    Ok(fields)
}

fn preview(payload: &[u8]) -> String {
    let head = &payload[..payload.len().min(PREVIEW_BYTES)];
    let ellipsis = if payload.len() > PREVIEW_BYTES { "…" } else { "" };
    match std::str::from_utf8(head) {
        Ok(text) => format!("{text:?}{ellipsis}"),
        Err(_) => format!("0x{}{ellipsis}", hex::encode(head)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::PROTOCOL_VERSION;

    fn field<'a>(fields: &'a [(&'static str, String)], name: &str) -> &'a str {
        fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("missing field {name}"))
    }

    #[test]
    fn test_describe_signed_announce() {
        let keys = IdentityKeys::generate();
        let payload = AnnouncePayload::new(keys.public_key(), PROTOCOL_VERSION, "alice").encode();
        let mut packet = Packet::new(PacketType::Announce, 0, keys.public_key(), None, payload).unwrap();
        keys.sign(&mut packet).unwrap();

        let fields = describe(&packet.serialize()).unwrap();
        assert_eq!(field(&fields, "type"), "Announce");
        assert_eq!(field(&fields, "recipient"), "broadcast");
        assert_eq!(field(&fields, "signature"), "valid");
        assert_eq!(field(&fields, "nickname"), "alice");
        assert_eq!(field(&fields, "key matches sender"), "true");
    }

    #[test]
    fn test_describe_tampered_message() {
        let keys = IdentityKeys::generate();
        let mut packet =
            Packet::new(PacketType::Message, 7, keys.public_key(), None, b"hello".to_vec()).unwrap();
        keys.sign(&mut packet).unwrap();
        let mut bytes = packet.serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let fields = describe(&bytes).unwrap();
        assert_eq!(field(&fields, "signature"), "INVALID");
        assert_eq!(field(&fields, "payload"), "5 bytes");
    }

    #[test]
    fn test_describe_rejects_garbage() {
        assert!(describe(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_parse_hex_variants() {
        assert_eq!(parse_hex("0x0102 03").unwrap(), vec![1, 2, 3]);
        assert!(parse_hex("xyz").is_err());
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(b"hi"), "\"hi\"");
        assert_eq!(preview(&[0xFF, 0x00]), "0xff00");
        assert!(preview(&[b'a'; 100]).ends_with('…'));
    }
}
