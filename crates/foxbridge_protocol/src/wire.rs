//! Binary `MESSAGE_DATA` framing
//!
//! Layout of the single binary frame shape the server emits:
//!
//! | offset | size | field           |
//! |--------|------|-----------------|
//! | 0      | 1    | opcode (0x01)   |
//! | 1      | 4    | subscription id, little-endian |
//! | 5      | 8    | timestamp, little-endian       |
//! | 13     | N    | payload         |
//!
//! The opcode, timestamp and payload are identical for every recipient of a
//! broadcast, so the frame is built once and only the subscription-id bytes
//! are restamped per subscription.

use crate::message::{ProtocolError, SubscriptionId};

pub const MESSAGE_DATA_OPCODE: u8 = 0x01;
pub const MESSAGE_DATA_HEADER_LEN: usize = 1 + 4 + 8;

/// Build a `MESSAGE_DATA` frame with the subscription id left zeroed.
///
/// Callers stamp the real subscription id with [`stamp_subscription_id`]
/// before handing the frame to each recipient.
pub fn message_data_frame(timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; MESSAGE_DATA_HEADER_LEN + payload.len()];
    frame[0] = MESSAGE_DATA_OPCODE;
    frame[5..13].copy_from_slice(&timestamp.to_le_bytes());
    frame[13..].copy_from_slice(payload);
    frame
}

/// Overwrite the subscription-id bytes of an existing frame.
pub fn stamp_subscription_id(frame: &mut [u8], subscription_id: SubscriptionId) {
    frame[1..5].copy_from_slice(&subscription_id.to_le_bytes());
}

/// A decoded view of a `MESSAGE_DATA` frame, borrowing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageData<'a> {
    pub subscription_id: SubscriptionId,
    pub timestamp: u64,
    pub payload: &'a [u8],
}

/// Decode a binary frame received from a server.
///
/// Used by client-side tooling and tests; the server itself never decodes
/// binary frames.
pub fn decode_message_data(frame: &[u8]) -> Result<MessageData<'_>, ProtocolError> {
    if frame.len() < MESSAGE_DATA_HEADER_LEN {
        return Err(ProtocolError::TruncatedFrame(frame.len()));
    }
    if frame[0] != MESSAGE_DATA_OPCODE {
        return Err(ProtocolError::UnexpectedOpcode(frame[0]));
    }
    let mut subscription_id = [0u8; 4];
    subscription_id.copy_from_slice(&frame[1..5]);
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&frame[5..13]);
    Ok(MessageData {
        subscription_id: SubscriptionId::from_le_bytes(subscription_id),
        timestamp: u64::from_le_bytes(timestamp),
        payload: &frame[MESSAGE_DATA_HEADER_LEN..],
    })
}
