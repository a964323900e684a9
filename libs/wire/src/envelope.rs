//! Control-stream message envelopes.

use serde::{Deserialize, Serialize};

use crate::flags::CapFlags;
use crate::types::{Network, STATUS_OK};

/// Payload bytes serialize as base64 strings on the wire.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One captured or injected packet, as shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PacketRecord {
    /// Per-stream sequence number, or [`crate::PKT_NUM_NONE`] when the
    /// stream is observe-only and the packet cannot be filtered.
    pub pkt_num: i64,
    /// Id of the session the packet crossed.
    pub proxy_id: u32,
    pub network: Network,
    /// `host:port` the packet came from.
    pub source: String,
    /// `host:port` the packet is headed to.
    pub dest: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub flags: CapFlags,
}

/// Discriminant for typed 200 payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ServerMsgType {
    Packet,
}

impl TryFrom<i64> for ServerMsgType {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ServerMsgType::Packet),
            other => Err(format!("unknown server message type {other}")),
        }
    }
}

impl From<ServerMsgType> for i64 {
    fn from(t: ServerMsgType) -> i64 {
        match t {
            ServerMsgType::Packet => 1,
        }
    }
}

/// Typed payload of a 200 envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerMsg {
    pub r#type: ServerMsgType,
    pub data: PacketRecord,
}

/// Body of a core → operator envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeBody {
    Msg(ServerMsg),
    Error(String),
}

/// Core → operator envelope. Status 200 carries a [`ServerMsg`], any
/// other status carries a human-readable error string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub status: i32,
    pub data: EnvelopeBody,
}

impl Envelope {
    /// Wrap a packet record in a 200 envelope.
    pub fn packet(record: PacketRecord) -> Self {
        Envelope {
            status: STATUS_OK,
            data: EnvelopeBody::Msg(ServerMsg {
                r#type: ServerMsgType::Packet,
                data: record,
            }),
        }
    }

    /// Build an error envelope. `status` must not be 200.
    pub fn error(status: i32, message: impl Into<String>) -> Self {
        debug_assert_ne!(status, STATUS_OK);
        Envelope {
            status,
            data: EnvelopeBody::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != STATUS_OK
    }
}

/// Discriminant of an operator → core request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ClientMsgType {
    Inject,
    Close,
    Filter,
}

impl TryFrom<i64> for ClientMsgType {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ClientMsgType::Inject),
            2 => Ok(ClientMsgType::Close),
            3 => Ok(ClientMsgType::Filter),
            other => Err(format!("unknown request type {other}")),
        }
    }
}

impl From<ClientMsgType> for i64 {
    fn from(t: ClientMsgType) -> i64 {
        match t {
            ClientMsgType::Inject => 1,
            ClientMsgType::Close => 2,
            ClientMsgType::Filter => 3,
        }
    }
}

/// Operator → core request.
///
/// `Target` is a session id for Inject/Close ([`crate::TARGET_ALL`] to
/// broadcast) and a packet sequence number for Filter. `Extra` carries
/// the per-type bits ([`crate::INJECT_TO_CLIENT`], [`crate::INJECT_TO_SERVER`],
/// [`crate::FILTER_ALLOW`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientMsg {
    pub r#type: ClientMsgType,
    #[serde(default)]
    pub target: i64,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub extra: u64,
}
