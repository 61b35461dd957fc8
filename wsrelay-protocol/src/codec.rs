//! Wire codecs: JSON (default) and a length-prefixed binary variant.
//!
//! One WebSocket message equals one packet in both variants. The JSON
//! codec produces text messages with the shapes documented on `Packet`;
//! the binary codec produces self-describing binary messages:
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | magic  | version | flags  | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes|
//! +--------+---------+--------+-------------+--------+
//! | source | sections | [channel] | [data] | [rpc]   |
//! +--------+----------+-----------+--------+---------+
//! ```
//!
//! Raw byte payloads are carried natively in the binary variant; the JSON
//! variant base64-wraps them.

use crate::error::ProtocolError;
use crate::packet::{Packet, PacketData, PacketSource};
use crate::rpc::Rpc;
use crate::{BINARY_VERSION, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying binary wsrelay packets.
pub const MAGIC: [u8; 4] = *b"WSRL";

/// Size of the fixed binary header in bytes (4+2+2+4+4 = 16).
pub const BINARY_HEADER_SIZE: usize = 16;

/// Wire encoding used by a server and its clients. Both sides must agree;
/// the choice is made at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Cross-language JSON text messages (default).
    #[default]
    Json,
    /// Length-prefixed binary messages with CRC32C validation.
    Binary,
}

/// JSON wire codec.
pub mod json {
    use super::*;

    /// Encodes a packet as a JSON text message.
    pub fn encode(packet: &Packet) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(packet)?)
    }

    /// Decodes a packet from a JSON text message.
    pub fn decode(text: &str) -> Result<Packet, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Binary wire codec.
pub mod binary {
    use super::*;

    const FLAG_CRC_PRESENT: u16 = 1 << 0;
    const VALID_FLAGS_MASK: u16 = FLAG_CRC_PRESENT;

    const SECTION_DATA: u8 = 1 << 0;
    const SECTION_CHANNEL: u8 = 1 << 1;
    const SECTION_RPC: u8 = 1 << 2;
    const VALID_SECTIONS_MASK: u8 = SECTION_DATA | SECTION_CHANNEL | SECTION_RPC;

    const DATA_TAG_BYTES: u8 = 0;
    const DATA_TAG_JSON: u8 = 1;

    /// Encodes a packet as a binary message.
    pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
        let payload = encode_payload(packet)?;

        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: payload.len() as u32,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(BINARY_HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(BINARY_VERSION);
        buf.put_u16(FLAG_CRC_PRESENT);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(crc32c::crc32c(&payload));
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decodes a packet from a complete binary message.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        if data.len() < BINARY_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: BINARY_HEADER_SIZE - data.len(),
            });
        }

        let magic: [u8; 4] = data[0..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != BINARY_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = u16::from_be_bytes([data[6], data[7]]);
        if flags & !VALID_FLAGS_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(flags));
        }

        let payload_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: payload_len as u32,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        let total = BINARY_HEADER_SIZE + payload_len;
        if data.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total - data.len(),
            });
        }

        let payload = &data[BINARY_HEADER_SIZE..total];
        if flags & FLAG_CRC_PRESENT != 0 {
            let crc_actual = crc32c::crc32c(payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        decode_payload(payload)
    }

    fn encode_payload(packet: &Packet) -> Result<BytesMut, ProtocolError> {
        let mut sections = 0u8;
        if packet.data.is_some() {
            sections |= SECTION_DATA;
        }
        if packet.channel.is_some() {
            sections |= SECTION_CHANNEL;
        }
        if packet.rpc.is_some() {
            sections |= SECTION_RPC;
        }

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(packet.source.into());
        buf.put_u8(sections);

        if let Some(channel) = &packet.channel {
            buf.put_u16(channel.len() as u16);
            buf.put_slice(channel.as_bytes());
        }

        if let Some(data) = &packet.data {
            match data {
                PacketData::Bytes(bytes) => {
                    buf.put_u8(DATA_TAG_BYTES);
                    buf.put_u32(bytes.len() as u32);
                    buf.put_slice(bytes);
                }
                PacketData::Value(value) => {
                    let encoded = serde_json::to_vec(value)?;
                    buf.put_u8(DATA_TAG_JSON);
                    buf.put_u32(encoded.len() as u32);
                    buf.put_slice(&encoded);
                }
            }
        }

        if let Some(rpc) = &packet.rpc {
            let encoded = serde_json::to_vec(rpc)?;
            buf.put_u32(encoded.len() as u32);
            buf.put_slice(&encoded);
        }

        Ok(buf)
    }

    fn decode_payload(payload: &[u8]) -> Result<Packet, ProtocolError> {
        let mut buf = payload;

        let source = PacketSource::try_from(take_u8(&mut buf)?)?;
        let sections = take_u8(&mut buf)?;
        if sections & !VALID_SECTIONS_MASK != 0 {
            return Err(ProtocolError::InvalidSections(sections));
        }

        let channel = if sections & SECTION_CHANNEL != 0 {
            let len = take_u16(&mut buf)? as usize;
            let raw = take_slice(&mut buf, len)?;
            let name = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
            Some(name.to_string())
        } else {
            None
        };

        let data = if sections & SECTION_DATA != 0 {
            let tag = take_u8(&mut buf)?;
            let len = take_u32(&mut buf)? as usize;
            let raw = take_slice(&mut buf, len)?;
            match tag {
                DATA_TAG_BYTES => Some(PacketData::Bytes(raw.to_vec())),
                DATA_TAG_JSON => Some(PacketData::Value(serde_json::from_slice(raw)?)),
                other => return Err(ProtocolError::InvalidSections(other)),
            }
        } else {
            None
        };

        let rpc = if sections & SECTION_RPC != 0 {
            let len = take_u32(&mut buf)? as usize;
            let raw = take_slice(&mut buf, len)?;
            Some(serde_json::from_slice::<Rpc>(raw)?)
        } else {
            None
        };

        Ok(Packet {
            source,
            data,
            channel,
            rpc,
        })
    }

    fn take_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Truncated { needed: 1 });
        }
        Ok(buf.get_u8())
    }

    fn take_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
        if buf.remaining() < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2 - buf.remaining(),
            });
        }
        Ok(buf.get_u16())
    }

    fn take_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4 - buf.remaining(),
            });
        }
        Ok(buf.get_u32())
    }

    fn take_slice<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
        if buf.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len - buf.remaining(),
            });
        }
        let (head, tail) = buf.split_at(len);
        *buf = tail;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcRequest, RpcResponse};
    use serde_json::json;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::new(PacketSource::Server, "hello"),
            Packet::new(PacketSource::Client, json!({"k": [1, 2, 3], "nested": {"v": null}})),
            Packet::new(PacketSource::Server, vec![0u8, 159, 146, 150]),
            Packet::channel("room1", "hi"),
            Packet::broadcast("all hands"),
            Packet::request(
                RpcRequest::new("add").with_args(vec![json!(10), json!(20)]),
            ),
            Packet::response(RpcResponse::ok("id-1", json!(30))),
            Packet::response(RpcResponse::ok("id-2", json!(null))),
            Packet::new(PacketSource::Server, "héllo wörld ✓"),
        ]
    }

    #[test]
    fn test_json_roundtrip() {
        for packet in sample_packets() {
            let encoded = json::encode(&packet).unwrap();
            let decoded = json::decode(&encoded).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_binary_roundtrip() {
        for packet in sample_packets() {
            let encoded = binary::encode(&packet).unwrap();
            let decoded = binary::decode(&encoded).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_binary_carries_bytes_natively() {
        let raw = vec![0u8, 1, 2, 3, 255, 254];
        let packet = Packet::new(PacketSource::Server, raw.clone());
        let encoded = binary::encode(&packet).unwrap();

        // The raw bytes appear verbatim in the message, no base64 detour.
        assert!(encoded
            .windows(raw.len())
            .any(|window| window == raw.as_slice()));
    }

    #[test]
    fn test_binary_rejects_bad_magic() {
        let packet = Packet::new(PacketSource::Server, "x");
        let mut encoded = BytesMut::from(&binary::encode(&packet).unwrap()[..]);
        encoded[0] = b'X';
        assert!(matches!(
            binary::decode(&encoded),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_binary_rejects_corrupt_payload() {
        let packet = Packet::new(PacketSource::Server, "checksummed");
        let mut encoded = BytesMut::from(&binary::encode(&packet).unwrap()[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            binary::decode(&encoded),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_binary_rejects_truncation() {
        let packet = Packet::new(PacketSource::Server, "truncate me");
        let encoded = binary::encode(&packet).unwrap();
        assert!(matches!(
            binary::decode(&encoded[..encoded.len() - 3]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            binary::decode(&encoded[..4]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_binary_rejects_unknown_version() {
        let packet = Packet::new(PacketSource::Server, "x");
        let mut encoded = BytesMut::from(&binary::encode(&packet).unwrap()[..]);
        encoded[4] = 0xFF;
        assert!(matches!(
            binary::decode(&encoded),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_json_decode_failure() {
        assert!(json::decode("not json at all").is_err());
        assert!(json::decode(r#"{"source": 99}"#).is_err());
    }

    #[test]
    fn test_json_request_wire_example() {
        // The documented wire shape for a client RPC request.
        let text = r#"{"rpc":{"type":"request","call_id":"u-1","method":"add","args":[10,20],"kwargs":{}},"source":5}"#;
        let packet = json::decode(text).unwrap();
        assert_eq!(packet.source, PacketSource::Rpc);
        let req = packet.rpc_request().unwrap();
        assert_eq!(req.method, "add");
        assert_eq!(req.args, vec![json!(10), json!(20)]);
    }
}
