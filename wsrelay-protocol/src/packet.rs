//! The packet model: the framework's unit of application-level messaging.

use crate::error::ProtocolError;
use crate::rpc::{Rpc, RpcRequest, RpcResponse};
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// JSON object key wrapping raw byte payloads on the JSON wire.
pub const BYTES_KEY: &str = "__bytes__";

/// Origin of a packet. Encoded as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PacketSource {
    Client = 1,
    Server = 2,
    Channel = 3,
    Broadcast = 4,
    Rpc = 5,
}

impl From<PacketSource> for u8 {
    fn from(source: PacketSource) -> u8 {
        source as u8
    }
}

impl TryFrom<u8> for PacketSource {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(PacketSource::Client),
            2 => Ok(PacketSource::Server),
            3 => Ok(PacketSource::Channel),
            4 => Ok(PacketSource::Broadcast),
            5 => Ok(PacketSource::Rpc),
            other => Err(ProtocolError::InvalidSource(other)),
        }
    }
}

/// Packet payload: an arbitrary JSON value or a raw byte string.
///
/// On the JSON wire, bytes travel base64-wrapped as `{"__bytes__": "..."}`
/// and are reconstituted on decode. The binary wire carries them natively.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Value(Value),
    Bytes(Vec<u8>),
}

impl PacketData {
    /// Returns the payload as a string slice if it is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PacketData::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the payload as raw bytes if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PacketData::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        PacketData::Value(Value::String(s.to_string()))
    }
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        PacketData::Value(Value::String(s))
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        PacketData::Bytes(b)
    }
}

impl From<&[u8]> for PacketData {
    fn from(b: &[u8]) -> Self {
        PacketData::Bytes(b.to_vec())
    }
}

impl From<Value> for PacketData {
    fn from(v: Value) -> Self {
        PacketData::Value(v)
    }
}

impl Serialize for PacketData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PacketData::Value(v) => v.serialize(serializer),
            PacketData::Bytes(b) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(
                    BYTES_KEY.to_string(),
                    Value::String(BASE64_STANDARD.encode(b)),
                );
                Value::Object(map).serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for PacketData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;

        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(Value::String(encoded)) = map.get(BYTES_KEY) {
                    let bytes = BASE64_STANDARD
                        .decode(encoded)
                        .map_err(|e| D::Error::custom(format!("invalid base64 payload: {e}")))?;
                    return Ok(PacketData::Bytes(bytes));
                }
            }
        }

        Ok(PacketData::Value(value))
    }
}

/// A structured packet exchanged between server and client.
///
/// Exactly one of `{data, rpc}` is semantically primary; the other is
/// inert when not applicable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub source: PacketSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PacketData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<Rpc>,
}

impl Packet {
    /// Creates a data-carrying packet with the given source.
    pub fn new(source: PacketSource, data: impl Into<PacketData>) -> Self {
        Self {
            source,
            data: Some(data.into()),
            channel: None,
            rpc: None,
        }
    }

    /// Creates a channel-delivery packet (`source = CHANNEL`).
    pub fn channel(channel: impl Into<String>, data: impl Into<PacketData>) -> Self {
        Self {
            source: PacketSource::Channel,
            data: Some(data.into()),
            channel: Some(channel.into()),
            rpc: None,
        }
    }

    /// Creates a broadcast packet (`source = BROADCAST`).
    pub fn broadcast(data: impl Into<PacketData>) -> Self {
        Self {
            source: PacketSource::Broadcast,
            data: Some(data.into()),
            channel: None,
            rpc: None,
        }
    }

    /// Wraps an RPC request into a packet (`source = RPC`).
    pub fn request(request: RpcRequest) -> Self {
        Self {
            source: PacketSource::Rpc,
            data: None,
            channel: None,
            rpc: Some(Rpc::Request(request)),
        }
    }

    /// Wraps an RPC response into a packet (`source = RPC`).
    pub fn response(response: RpcResponse) -> Self {
        Self {
            source: PacketSource::Rpc,
            data: None,
            channel: None,
            rpc: Some(Rpc::Response(response)),
        }
    }

    /// Returns the RPC request inside this packet, if any.
    pub fn rpc_request(&self) -> Option<&RpcRequest> {
        match &self.rpc {
            Some(Rpc::Request(req)) => Some(req),
            _ => None,
        }
    }

    /// Returns the RPC response inside this packet, if any.
    pub fn rpc_response(&self) -> Option<&RpcResponse> {
        match &self.rpc {
            Some(Rpc::Response(resp)) => Some(resp),
            _ => None,
        }
    }
}
