//! Client representation
//!
//! `ClientInfo` models one connected client: a UUID used to identify it
//! across broker operations, its remote endpoint for logs, the sending side
//! of the per-client outbound queue, and the subscription maps.
//!
//! The two maps are exact inverses of each other. All mutation goes through
//! `add_subscription`, `remove_subscription` and `remove_channel` so that the
//! invariant cannot be broken at a call site.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use foxbridge_protocol::{ChannelId, SubscriptionId};

pub type ClientId = String;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("connection closed")]
    Disconnected,
    #[error("send buffer limit exceeded ({queued} bytes queued)")]
    OverLimit { queued: usize },
}

/// Outbound frame queue for one client connection.
///
/// Wraps the sender half of the per-client channel drained by the send loop,
/// counting queued bytes so that data frames can be shed when a slow client
/// falls behind. Control frames (text, close) always queue; losing an
/// `advertise` or `status` would desynchronize the client's view of the
/// protocol, while losing a data frame only costs one message.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: UnboundedSender<WsMessage>,
    queued_bytes: Arc<AtomicUsize>,
    limit_bytes: usize,
}

impl OutboundQueue {
    /// A `limit_bytes` of 0 disables the cap.
    pub fn new(tx: UnboundedSender<WsMessage>, limit_bytes: usize) -> Self {
        Self {
            tx,
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            limit_bytes,
        }
    }

    /// Queue a control frame. Never shed.
    pub fn send_control(&self, msg: WsMessage) -> Result<(), EnqueueError> {
        self.queued_bytes.fetch_add(msg.len(), Ordering::Relaxed);
        self.tx.send(msg).map_err(|_| EnqueueError::Disconnected)
    }

    /// Queue a data frame, unless the client is over its send buffer limit.
    pub fn send_data(&self, msg: WsMessage) -> Result<(), EnqueueError> {
        let queued = self.queued_bytes.load(Ordering::Relaxed);
        if self.limit_bytes > 0 && queued + msg.len() > self.limit_bytes {
            return Err(EnqueueError::OverLimit { queued });
        }
        self.send_control(msg)
    }

    /// Credit back bytes once the send loop has written a frame out.
    pub fn mark_sent(&self, len: usize) {
        self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ClientInfo {
    pub id: ClientId,
    /// Remote endpoint string, for logs and callbacks.
    pub name: String,
    pub sender: OutboundQueue,
    /// Forward map: subscription id to channel id.
    pub subscriptions: HashMap<SubscriptionId, ChannelId>,
    /// Inverse map: channel id to the set of subscription ids covering it.
    pub subscriptions_by_channel: HashMap<ChannelId, BTreeSet<SubscriptionId>>,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, sender: OutboundQueue) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            sender,
            subscriptions: HashMap::new(),
            subscriptions_by_channel: HashMap::new(),
        }
    }

    /// Record a subscription in both maps. The caller is responsible for
    /// rejecting duplicate subscription ids first.
    pub fn add_subscription(&mut self, sub_id: SubscriptionId, chan_id: ChannelId) {
        self.subscriptions.insert(sub_id, chan_id);
        self.subscriptions_by_channel
            .entry(chan_id)
            .or_default()
            .insert(sub_id);
    }

    /// Remove a subscription from both maps, dropping the inverse-map entry
    /// when its set becomes empty. Returns the channel the subscription
    /// covered, or `None` if the id was unknown.
    pub fn remove_subscription(&mut self, sub_id: SubscriptionId) -> Option<ChannelId> {
        let chan_id = self.subscriptions.remove(&sub_id)?;
        if let Some(subs) = self.subscriptions_by_channel.get_mut(&chan_id) {
            subs.remove(&sub_id);
            if subs.is_empty() {
                self.subscriptions_by_channel.remove(&chan_id);
            }
        }
        Some(chan_id)
    }

    /// Drop every subscription referencing a channel that the server removed.
    pub fn remove_channel(&mut self, chan_id: ChannelId) {
        if let Some(subs) = self.subscriptions_by_channel.remove(&chan_id) {
            for sub_id in subs {
                self.subscriptions.remove(&sub_id);
            }
        }
    }
}
