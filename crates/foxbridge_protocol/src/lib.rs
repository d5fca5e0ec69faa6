//! foxbridge_protocol
//!
//! Wire-level definitions for the `foxglove.websocket.v1` protocol:
//! - JSON control messages exchanged as WebSocket text frames
//!   (`subscribe`/`unsubscribe` from clients, `serverInfo`/`advertise`/
//!   `unadvertise`/`status` from the server)
//! - the binary `MESSAGE_DATA` frame used to fan out channel payloads
//!
//! This crate is transport-agnostic: it knows nothing about sockets or
//! WebSocket framing, only about the bytes and JSON shapes that travel
//! inside frames. Higher-level crates (the server, the example client)
//! build on these types.

pub mod message;
pub mod wire;

pub use message::{
    parse_client_message, Channel, ChannelId, ChannelSpec, ClientMessage, ProtocolError,
    ServerMessage, StatusLevel, Subscription, SubscriptionId, SUBPROTOCOL,
};
pub use wire::{
    decode_message_data, message_data_frame, stamp_subscription_id, MessageData,
    MESSAGE_DATA_HEADER_LEN, MESSAGE_DATA_OPCODE,
};
