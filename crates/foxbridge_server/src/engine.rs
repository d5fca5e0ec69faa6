//! Broker engine
//!
//! The broker owns all mutable server state: the channel registry, the table
//! of connected clients, and the application's subscription handlers. It is
//! held behind an `Arc<Mutex<Broker>>` shared by the transport layer and the
//! embedding application, which serializes protocol-event handling against
//! application-driven mutations.
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous. Sending never blocks: frames are
//!   pushed onto per-client queues drained by the connection's send loop, so
//!   holding the broker lock does not wait on network I/O.
//! - Subscription handlers run while the lock is held. They must not call
//!   back into the broker.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::{error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use foxbridge_client::{ClientId, ClientInfo};
use foxbridge_protocol::{
    wire, Channel, ChannelId, ChannelSpec, ServerMessage, StatusLevel, Subscription,
    SubscriptionId,
};

/// Edge-triggered notification invoked with the channel id and the client
/// that caused the transition.
pub type SubscriptionHandler = Box<dyn FnMut(ChannelId, &ClientId) + Send>;

pub struct Broker {
    name: String,
    pub channels: BTreeMap<ChannelId, Channel>,
    pub clients: HashMap<ClientId, ClientInfo>,
    next_channel_id: ChannelId,
    subscribe_handler: Option<SubscriptionHandler>,
    unsubscribe_handler: Option<SubscriptionHandler>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.name)
            .field("channels", &self.channels.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl Broker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: BTreeMap::new(),
            clients: HashMap::new(),
            next_channel_id: 0,
            subscribe_handler: None,
            unsubscribe_handler: None,
        }
    }

    /// Called when the first client subscribes to a channel.
    pub fn set_subscribe_handler(
        &mut self,
        handler: impl FnMut(ChannelId, &ClientId) + Send + 'static,
    ) {
        self.subscribe_handler = Some(Box::new(handler));
    }

    /// Called when the last subscription covering a channel goes away,
    /// whether by unsubscription or by disconnect.
    pub fn set_unsubscribe_handler(
        &mut self,
        handler: impl FnMut(ChannelId, &ClientId) + Send + 'static,
    ) {
        self.unsubscribe_handler = Some(Box::new(handler));
    }

    /// Insert a freshly accepted connection and greet it with `serverInfo`
    /// followed by an `advertise` for the full current channel set.
    pub fn register_client(&mut self, client: ClientInfo) {
        info!(client = %client.name, "client connected");
        Self::send_server_message(
            &client,
            &ServerMessage::ServerInfo {
                name: self.name.clone(),
                capabilities: Vec::new(),
            },
        );
        Self::send_server_message(
            &client,
            &ServerMessage::Advertise {
                channels: self.channels.values().cloned().collect(),
            },
        );
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a disconnected client and fire the unsubscribe handler for
    /// every channel it was the last subscriber of. The inverse map of the
    /// removed client decides which channels to check.
    pub fn cleanup_client(&mut self, client_id: &ClientId) {
        let Some(client) = self.clients.remove(client_id) else {
            error!(client = %client_id, "disconnect for a client not in the table");
            return;
        };
        info!(client = %client.name, "client disconnected");
        for chan_id in client.subscriptions_by_channel.keys() {
            if !self.any_subscribed(*chan_id) {
                if let Some(handler) = self.unsubscribe_handler.as_mut() {
                    handler(*chan_id, client_id);
                }
            }
        }
    }

    /// Register new channels and advertise them to every connected client in
    /// one frame. Ids are pre-incremented, so the first channel gets id 1 and
    /// ids from successive calls are strictly increasing.
    pub fn add_channels(&mut self, specs: Vec<ChannelSpec>) -> Vec<ChannelId> {
        let mut added = Vec::with_capacity(specs.len());
        for spec in specs {
            self.next_channel_id += 1;
            let id = self.next_channel_id;
            self.channels.insert(id, spec.into_channel(id));
            added.push(id);
        }
        if added.is_empty() {
            return added;
        }
        let advertise = ServerMessage::Advertise {
            channels: added.iter().map(|id| self.channels[id].clone()).collect(),
        };
        for client in self.clients.values() {
            Self::send_server_message(client, &advertise);
        }
        added
    }

    pub fn add_channel(&mut self, spec: ChannelSpec) -> ChannelId {
        self.add_channels(vec![spec])[0]
    }

    /// Drop channels from the registry, purge every client subscription that
    /// referenced them, and send a single `unadvertise` naming the removed
    /// ids. Server-initiated removal does not fire the unsubscribe handler.
    pub fn remove_channels(&mut self, ids: &[ChannelId]) {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.channels.remove(id).is_some() {
                removed.push(*id);
            } else {
                warn!(channel = *id, "remove_channels: channel id not in registry");
            }
        }
        if removed.is_empty() {
            return;
        }
        info!(channels = ?removed, "channels removed");
        let unadvertise = ServerMessage::Unadvertise {
            channel_ids: removed.clone(),
        };
        for client in self.clients.values_mut() {
            for id in &removed {
                client.remove_channel(*id);
            }
            Self::send_server_message(client, &unadvertise);
        }
    }

    pub fn remove_channel(&mut self, id: ChannelId) {
        self.remove_channels(&[id]);
    }

    /// Process a `subscribe` batch from one client. Entries are handled in
    /// order and independently: a rejected entry gets a `status` reply and
    /// does not stop the rest of the batch.
    pub fn handle_subscribe(&mut self, client_id: &ClientId, subscriptions: Vec<Subscription>) {
        for sub in subscriptions {
            let Some(client) = self.clients.get(client_id) else {
                error!(client = %client_id, "subscribe from a client not in the table");
                return;
            };
            if client.subscriptions.contains_key(&sub.id) {
                Self::send_status(
                    client,
                    StatusLevel::Error,
                    format!(
                        "Client subscription id {} was already used; ignoring subscription",
                        sub.id
                    ),
                );
                continue;
            }
            if !self.channels.contains_key(&sub.channel_id) {
                Self::send_status(
                    client,
                    StatusLevel::Warning,
                    format!(
                        "Channel {} is not available; ignoring subscription",
                        sub.channel_id
                    ),
                );
                continue;
            }
            info!(
                client = %client.name,
                channel = sub.channel_id,
                subscription = sub.id,
                "client subscribed"
            );
            let first_subscription = !self.any_subscribed(sub.channel_id);
            if let Some(client) = self.clients.get_mut(client_id) {
                client.add_subscription(sub.id, sub.channel_id);
            }
            if first_subscription {
                if let Some(handler) = self.subscribe_handler.as_mut() {
                    handler(sub.channel_id, client_id);
                }
            }
        }
    }

    /// Process an `unsubscribe` batch from one client, firing the
    /// unsubscribe handler for each channel whose last subscription across
    /// all clients just went away.
    pub fn handle_unsubscribe(&mut self, client_id: &ClientId, subscription_ids: &[SubscriptionId]) {
        for sub_id in subscription_ids {
            let Some(client) = self.clients.get_mut(client_id) else {
                error!(client = %client_id, "unsubscribe from a client not in the table");
                return;
            };
            let Some(chan_id) = client.remove_subscription(*sub_id) else {
                Self::send_status(
                    client,
                    StatusLevel::Warning,
                    format!(
                        "Client subscription id {sub_id} did not exist; ignoring unsubscription"
                    ),
                );
                continue;
            };
            info!(client = %client.name, channel = chan_id, "client unsubscribed");
            if !self.any_subscribed(chan_id) {
                if let Some(handler) = self.unsubscribe_handler.as_mut() {
                    handler(chan_id, client_id);
                }
            }
        }
    }

    /// Reply to an unrecognized opcode with a `status` error.
    pub fn handle_unknown_op(&mut self, client_id: &ClientId, op: &str) {
        error!(client = %client_id, "unrecognized client opcode: {op}");
        if let Some(client) = self.clients.get(client_id) {
            Self::send_status(
                client,
                StatusLevel::Error,
                format!("Unrecognized opcode {op}"),
            );
        }
    }

    /// Reply to a frame that could not be parsed with a `status` error
    /// naming the parse failure. The connection stays up.
    pub fn handle_malformed_message(&mut self, client_id: &ClientId, detail: &str) {
        if let Some(client) = self.clients.get(client_id) {
            Self::send_status(
                client,
                StatusLevel::Error,
                format!("Failed to parse message: {detail}"),
            );
        }
    }

    /// Fan a payload out to every subscription covering `chan_id`.
    ///
    /// The frame is built lazily on the first match and only the
    /// subscription-id bytes are restamped per recipient, so a broadcast with
    /// no subscribers allocates nothing. Send failures are logged and do not
    /// stop the fan-out.
    pub fn broadcast_message(&self, chan_id: ChannelId, timestamp: u64, payload: &[u8]) {
        let mut frame: Option<Vec<u8>> = None;
        for client in self.clients.values() {
            let Some(subs) = client.subscriptions_by_channel.get(&chan_id) else {
                continue;
            };
            for sub_id in subs {
                let buf = frame.get_or_insert_with(|| wire::message_data_frame(timestamp, payload));
                wire::stamp_subscription_id(buf, *sub_id);
                if let Err(e) = client.sender.send_data(WsMessage::Binary(buf.clone().into())) {
                    warn!(client = %client.name, channel = chan_id, "dropping data frame: {e}");
                }
            }
        }
    }

    /// True if any subscription of any client covers `chan_id`.
    pub fn any_subscribed(&self, chan_id: ChannelId) -> bool {
        self.clients
            .values()
            .any(|c| c.subscriptions_by_channel.contains_key(&chan_id))
    }

    pub fn remote_endpoint(&self, client_id: &ClientId) -> Option<&str> {
        self.clients.get(client_id).map(|c| c.name.as_str())
    }

    fn send_status(client: &ClientInfo, level: StatusLevel, message: String) {
        Self::send_server_message(client, &ServerMessage::Status { level, message });
    }

    fn send_server_message(client: &ClientInfo, msg: &ServerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize server message: {e}");
                return;
            }
        };
        if let Err(e) = client.sender.send_control(WsMessage::Text(text.into())) {
            warn!(client = %client.name, "failed to queue control frame: {e}");
        }
    }
}
