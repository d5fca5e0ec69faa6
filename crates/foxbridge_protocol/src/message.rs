//! JSON control-message grammar
//!
//! Text frames in both directions are JSON objects carrying an `"op"` field
//! that selects the operation. The client grammar is deliberately small:
//! `subscribe` and `unsubscribe` are the only operations a client may issue.
//! Anything else is reported back with a `status` message rather than
//! silently dropped, so a misbehaving client can see what it did wrong.
//!
//! Notes on fields:
//! - channel ids are assigned by the server and never reused
//! - subscription ids are chosen by the client and are only meaningful
//!   within that client's connection
//! - `schema` is an opaque string; the server never inspects it

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WebSocket subprotocol negotiated during the HTTP upgrade. Clients that do
/// not list this exact string are rejected before the connection opens.
pub const SUBPROTOCOL: &str = "foxglove.websocket.v1";

/// Server-assigned channel identifier, strictly increasing per server.
pub type ChannelId = u32;

/// Client-chosen subscription identifier, unique within one connection.
pub type SubscriptionId = u32;

/// Severity of a `status` message, serialized as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

impl From<StatusLevel> for u8 {
    fn from(level: StatusLevel) -> Self {
        match level {
            StatusLevel::Info => 0,
            StatusLevel::Warning => 1,
            StatusLevel::Error => 2,
        }
    }
}

impl TryFrom<u8> for StatusLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(StatusLevel::Info),
            1 => Ok(StatusLevel::Warning),
            2 => Ok(StatusLevel::Error),
            other => Err(format!("invalid status level {other}")),
        }
    }
}

/// A published channel as advertised to clients.
///
/// Immutable once created; the registry keys on `id` alone, so two channels
/// may carry identical topic/encoding/schema tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

/// A channel descriptor as supplied by the embedding application, before the
/// server has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    pub topic: String,
    pub encoding: String,
    pub schema_name: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_encoding: Option<String>,
}

impl ChannelSpec {
    pub fn into_channel(self, id: ChannelId) -> Channel {
        Channel {
            id,
            topic: self.topic,
            encoding: self.encoding,
            schema_name: self.schema_name,
            schema: self.schema,
            schema_encoding: self.schema_encoding,
        }
    }
}

/// One entry of a `subscribe` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
}

/// Text messages a client may send to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { subscriptions: Vec<Subscription> },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        subscription_ids: Vec<SubscriptionId>,
    },
}

/// Text messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerInfo {
        name: String,
        capabilities: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Advertise { channels: Vec<Channel> },
    #[serde(rename_all = "camelCase")]
    Unadvertise { channel_ids: Vec<ChannelId> },
    #[serde(rename_all = "camelCase")]
    Status { level: StatusLevel, message: String },
}

/// Errors produced while decoding inbound frames.
///
/// `UnknownOp` is separated from the malformed-frame cases so the server can
/// answer it with a `status` message while merely logging the rest.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no \"op\" field")]
    MissingOp,
    #[error("unrecognized opcode {0}")]
    UnknownOp(String),
    #[error("binary frame too short ({0} bytes)")]
    TruncatedFrame(usize),
    #[error("unexpected binary opcode {0:#04x}")]
    UnexpectedOpcode(u8),
}

/// Validating parser for client text frames.
///
/// Distinguishes three outcomes: a well-formed known message, a well-formed
/// object with an unknown `op` (answered with a `status` error), and a
/// malformed frame (logged by the caller, no response).
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let op = match value.get("op").and_then(serde_json::Value::as_str) {
        Some(op) => op.to_owned(),
        None => return Err(ProtocolError::MissingOp),
    };
    match op.as_str() {
        "subscribe" | "unsubscribe" => Ok(serde_json::from_value(value)?),
        _ => Err(ProtocolError::UnknownOp(op)),
    }
}
