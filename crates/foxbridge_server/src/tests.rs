use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use foxbridge_client::{ClientId, ClientInfo, OutboundQueue};
use foxbridge_protocol::{ChannelId, ChannelSpec, Subscription};

use super::engine::Broker;

fn spec(topic: &str) -> ChannelSpec {
    ChannelSpec {
        topic: topic.to_string(),
        encoding: "json".to_string(),
        schema_name: "S".to_string(),
        schema: "{}".to_string(),
        schema_encoding: None,
    }
}

fn connect_client(
    broker: &mut Broker,
    name: &str,
) -> (ClientId, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = ClientInfo::new(name, OutboundQueue::new(tx, 0));
    let client_id = client.id.clone();
    broker.register_client(client);
    (client_id, rx)
}

fn next_text(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> String {
    match rx.try_recv().expect("expected a queued frame") {
        WsMessage::Text(text) => text.as_str().to_owned(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn next_binary(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<u8> {
    match rx.try_recv().expect("expected a queued frame") {
        WsMessage::Binary(data) => data.to_vec(),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

type HandlerLog = Arc<Mutex<Vec<(ChannelId, ClientId)>>>;

fn record_subscribe_handler(broker: &mut Broker) -> HandlerLog {
    let calls: HandlerLog = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    broker.set_subscribe_handler(move |chan_id: ChannelId, client_id: &ClientId| {
        log.lock().unwrap().push((chan_id, client_id.clone()));
    });
    calls
}

fn record_unsubscribe_handler(broker: &mut Broker) -> HandlerLog {
    let calls: HandlerLog = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    broker.set_unsubscribe_handler(move |chan_id: ChannelId, client_id: &ClientId| {
        log.lock().unwrap().push((chan_id, client_id.clone()));
    });
    calls
}

#[test]
fn test_register_sends_server_info_then_advertise() {
    let mut broker = Broker::new("srv");
    let (_client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50000");

    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"serverInfo","name":"srv","capabilities":[]}"#
    );
    assert_eq!(next_text(&mut rx), r#"{"op":"advertise","channels":[]}"#);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_initial_advertise_lists_existing_channels() {
    let mut broker = Broker::new("srv");
    broker.add_channel(spec("a"));
    broker.add_channel(spec("b"));

    let (_client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50001");
    let _server_info = next_text(&mut rx);
    let advertise: serde_json::Value = serde_json::from_str(&next_text(&mut rx)).unwrap();
    assert_eq!(advertise["op"], "advertise");
    assert_eq!(advertise["channels"].as_array().unwrap().len(), 2);
}

#[test]
fn test_channel_ids_start_at_one_and_increase() {
    let mut broker = Broker::new("srv");
    let first = broker.add_channel(spec("a"));
    let second = broker.add_channel(spec("b"));
    let third = broker.add_channel(spec("c"));
    assert_eq!(first, 1);
    assert_eq!(second, 2);
    assert_eq!(third, 3);
}

#[test]
fn test_removed_channel_id_is_never_reused() {
    let mut broker = Broker::new("srv");
    let first = broker.add_channel(spec("a"));
    broker.remove_channel(first);
    let second = broker.add_channel(spec("a"));
    assert!(second > first);
}

#[test]
fn test_add_channel_advertises_to_connected_clients() {
    let mut broker = Broker::new("srv");
    let (_client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50002");
    next_text(&mut rx);
    next_text(&mut rx);

    let id = broker.add_channel(spec("t"));
    assert_eq!(id, 1);
    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"advertise","channels":[{"id":1,"topic":"t","encoding":"json","schemaName":"S","schema":"{}"}]}"#
    );
}

#[test]
fn test_add_channels_batch_is_one_frame() {
    let mut broker = Broker::new("srv");
    let (_client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50003");
    next_text(&mut rx);
    next_text(&mut rx);

    let ids = broker.add_channels(vec![spec("a"), spec("b")]);
    assert_eq!(ids, vec![1, 2]);

    let advertise: serde_json::Value = serde_json::from_str(&next_text(&mut rx)).unwrap();
    assert_eq!(advertise["channels"].as_array().unwrap().len(), 2);
    assert!(rx.try_recv().is_err(), "batch must produce a single frame");
}

#[test]
fn test_subscribe_then_broadcast() {
    let mut broker = Broker::new("srv");
    let subscribes = record_subscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50004");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(&client_id, vec![Subscription { id: 7, channel_id: chan_id }]);
    assert_eq!(subscribes.lock().unwrap().as_slice(), &[(1, client_id)]);

    broker.broadcast_message(chan_id, 0x0102030405060708, b"HI");
    assert_eq!(
        next_binary(&mut rx),
        [
            0x01, 0x07, 0x00, 0x00, 0x00, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x48,
            0x49,
        ]
    );
}

#[test]
fn test_duplicate_subscription_id_rejected() {
    let mut broker = Broker::new("srv");
    let subscribes = record_subscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50005");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(&client_id, vec![Subscription { id: 7, channel_id: chan_id }]);
    broker.handle_subscribe(&client_id, vec![Subscription { id: 7, channel_id: chan_id }]);

    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"status","level":2,"message":"Client subscription id 7 was already used; ignoring subscription"}"#
    );
    assert_eq!(subscribes.lock().unwrap().len(), 1);
}

#[test]
fn test_subscribe_unknown_channel_rejected() {
    let mut broker = Broker::new("srv");
    let subscribes = record_subscribe_handler(&mut broker);
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50006");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(&client_id, vec![Subscription { id: 8, channel_id: 999 }]);

    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"status","level":1,"message":"Channel 999 is not available; ignoring subscription"}"#
    );
    assert!(subscribes.lock().unwrap().is_empty());
    assert!(broker.clients[&client_id].subscriptions.is_empty());
}

#[test]
fn test_rejected_entry_does_not_stop_the_batch() {
    let mut broker = Broker::new("srv");
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50007");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(
        &client_id,
        vec![
            Subscription { id: 1, channel_id: 999 },
            Subscription { id: 2, channel_id: chan_id },
        ],
    );

    // First entry drew a warning, second entry still registered.
    let status: serde_json::Value = serde_json::from_str(&next_text(&mut rx)).unwrap();
    assert_eq!(status["op"], "status");
    assert_eq!(broker.clients[&client_id].subscriptions.get(&2), Some(&chan_id));
}

#[test]
fn test_unsubscribe_unknown_id_warns() {
    let mut broker = Broker::new("srv");
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50008");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_unsubscribe(&client_id, &[42]);

    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"status","level":1,"message":"Client subscription id 42 did not exist; ignoring unsubscription"}"#
    );
}

#[test]
fn test_last_unsubscribe_fires_handler() {
    let mut broker = Broker::new("srv");
    let unsubscribes = record_unsubscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, _rx) = connect_client(&mut broker, "127.0.0.1:50009");

    broker.handle_subscribe(
        &client_id,
        vec![
            Subscription { id: 1, channel_id: chan_id },
            Subscription { id: 2, channel_id: chan_id },
        ],
    );

    broker.handle_unsubscribe(&client_id, &[1]);
    assert!(unsubscribes.lock().unwrap().is_empty(), "channel still covered");

    broker.handle_unsubscribe(&client_id, &[2]);
    assert_eq!(
        unsubscribes.lock().unwrap().as_slice(),
        &[(chan_id, client_id)]
    );
}

#[test]
fn test_first_subscriber_edge_across_clients() {
    let mut broker = Broker::new("srv");
    let subscribes = record_subscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (a, _rx_a) = connect_client(&mut broker, "127.0.0.1:50010");
    let (b, _rx_b) = connect_client(&mut broker, "127.0.0.1:50011");

    broker.handle_subscribe(&a, vec![Subscription { id: 1, channel_id: chan_id }]);
    broker.handle_subscribe(&b, vec![Subscription { id: 1, channel_id: chan_id }]);

    // Only the transition from zero subscribers fires the handler.
    assert_eq!(subscribes.lock().unwrap().as_slice(), &[(chan_id, a)]);
}

#[test]
fn test_last_unsubscribe_on_disconnect() {
    let mut broker = Broker::new("srv");
    let unsubscribes = record_unsubscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (a, _rx_a) = connect_client(&mut broker, "127.0.0.1:50012");
    let (b, _rx_b) = connect_client(&mut broker, "127.0.0.1:50013");

    broker.handle_subscribe(&a, vec![Subscription { id: 1, channel_id: chan_id }]);
    broker.handle_subscribe(&b, vec![Subscription { id: 1, channel_id: chan_id }]);

    broker.cleanup_client(&a);
    assert!(unsubscribes.lock().unwrap().is_empty(), "b still subscribed");

    broker.cleanup_client(&b);
    assert_eq!(
        unsubscribes.lock().unwrap().as_slice(),
        &[(chan_id, b)]
    );
}

#[test]
fn test_cleanup_unknown_client_is_harmless() {
    let mut broker = Broker::new("srv");
    broker.cleanup_client(&"no-such-client".to_string());
    assert!(broker.clients.is_empty());
}

#[test]
fn test_remove_channel_unadvertises_and_purges() {
    let mut broker = Broker::new("srv");
    let unsubscribes = record_unsubscribe_handler(&mut broker);
    let first = broker.add_channel(spec("a"));
    let second = broker.add_channel(spec("b"));
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50014");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(
        &client_id,
        vec![
            Subscription { id: 1, channel_id: first },
            Subscription { id: 2, channel_id: second },
        ],
    );

    broker.remove_channel(first);

    assert_eq!(next_text(&mut rx), r#"{"op":"unadvertise","channelIds":[1]}"#);
    let client = &broker.clients[&client_id];
    assert!(!client.subscriptions.values().any(|c| *c == first));
    assert_eq!(client.subscriptions.get(&2), Some(&second));

    // Server-initiated removal does not fire the unsubscribe handler.
    assert!(unsubscribes.lock().unwrap().is_empty());

    // Broadcasting to the removed channel reaches nobody.
    broker.broadcast_message(first, 1, b"x");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_broadcast_stamps_each_subscription() {
    let mut broker = Broker::new("srv");
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50015");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_subscribe(
        &client_id,
        vec![
            Subscription { id: 3, channel_id: chan_id },
            Subscription { id: 9, channel_id: chan_id },
        ],
    );
    broker.broadcast_message(chan_id, 5, b"x");

    // One frame per subscription, differing only in the stamped id.
    let first = next_binary(&mut rx);
    let second = next_binary(&mut rx);
    assert_eq!(u32::from_le_bytes(first[1..5].try_into().unwrap()), 3);
    assert_eq!(u32::from_le_bytes(second[1..5].try_into().unwrap()), 9);
    assert_eq!(first[5..], second[5..]);
}

#[test]
fn test_broadcast_skips_unsubscribed_clients() {
    let mut broker = Broker::new("srv");
    let chan_id = broker.add_channel(spec("t"));
    let (a, mut rx_a) = connect_client(&mut broker, "127.0.0.1:50016");
    let (_b, mut rx_b) = connect_client(&mut broker, "127.0.0.1:50017");
    next_text(&mut rx_a);
    next_text(&mut rx_a);
    next_text(&mut rx_b);
    next_text(&mut rx_b);

    broker.handle_subscribe(&a, vec![Subscription { id: 1, channel_id: chan_id }]);
    broker.broadcast_message(chan_id, 1, b"x");

    assert!(!next_binary(&mut rx_a).is_empty());
    assert!(rx_b.try_recv().is_err());
}

#[test]
fn test_broadcast_survives_disconnected_recipient() {
    let mut broker = Broker::new("srv");
    let chan_id = broker.add_channel(spec("t"));
    let (a, rx_a) = connect_client(&mut broker, "127.0.0.1:50018");
    let (b, mut rx_b) = connect_client(&mut broker, "127.0.0.1:50019");
    broker.handle_subscribe(&a, vec![Subscription { id: 1, channel_id: chan_id }]);
    broker.handle_subscribe(&b, vec![Subscription { id: 1, channel_id: chan_id }]);

    // a's receiver is gone; the send error is logged and the fan-out continues.
    drop(rx_a);
    broker.broadcast_message(chan_id, 1, b"x");

    // Skip b's greeting frames, then expect the data frame.
    next_text(&mut rx_b);
    next_text(&mut rx_b);
    assert_eq!(next_binary(&mut rx_b)[13..], *b"x");
}

#[test]
fn test_unknown_op_gets_status_error() {
    let mut broker = Broker::new("srv");
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50020");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_unknown_op(&client_id, "publish");
    assert_eq!(
        next_text(&mut rx),
        r#"{"op":"status","level":2,"message":"Unrecognized opcode publish"}"#
    );
}

#[test]
fn test_malformed_message_gets_status_error() {
    let mut broker = Broker::new("srv");
    let (client_id, mut rx) = connect_client(&mut broker, "127.0.0.1:50022");
    next_text(&mut rx);
    next_text(&mut rx);

    broker.handle_malformed_message(&client_id, "message has no \"op\" field");
    let status: serde_json::Value = serde_json::from_str(&next_text(&mut rx)).unwrap();
    assert_eq!(status["level"], 2);
    assert_eq!(
        status["message"],
        "Failed to parse message: message has no \"op\" field"
    );
}

#[test]
fn test_remote_endpoint() {
    let mut broker = Broker::new("srv");
    let (client_id, _rx) = connect_client(&mut broker, "10.0.0.1:1234");
    assert_eq!(broker.remote_endpoint(&client_id), Some("10.0.0.1:1234"));
    assert_eq!(broker.remote_endpoint(&"nope".to_string()), None);
}

#[test]
fn test_resubscribe_after_full_unsubscribe_fires_again() {
    let mut broker = Broker::new("srv");
    let subscribes = record_subscribe_handler(&mut broker);
    let unsubscribes = record_unsubscribe_handler(&mut broker);
    let chan_id = broker.add_channel(spec("t"));
    let (client_id, _rx) = connect_client(&mut broker, "127.0.0.1:50021");

    broker.handle_subscribe(&client_id, vec![Subscription { id: 1, channel_id: chan_id }]);
    broker.handle_unsubscribe(&client_id, &[1]);
    broker.handle_subscribe(&client_id, vec![Subscription { id: 1, channel_id: chan_id }]);

    // Each false->true crossing fires once; so does each true->false.
    assert_eq!(subscribes.lock().unwrap().len(), 2);
    assert_eq!(unsubscribes.lock().unwrap().len(), 1);
}
