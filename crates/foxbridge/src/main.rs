//! CLI for foxbridge
//!
//! Subcommands:
//! - `server`: run the WebSocket server, advertising an example JSON channel
//!   and broadcasting a counter message until Ctrl-C
//! - `client`: run a simple example client that subscribes to every
//!   advertised channel and prints decoded frames (useful for smoke tests)

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use foxbridge_config::load_config;
use foxbridge_protocol::{ChannelSpec, SubscriptionId};
use foxbridge_server::{ClientId, Server};

#[derive(Parser)]
#[command(name = "foxbridge")]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Run the example client (connects, subscribes, prints messages)
    Client {
        /// WebSocket server URL to connect to (default: ws://127.0.0.1:8765)
        #[arg(long, default_value = "ws://127.0.0.1:8765")]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    foxbridge_utils::logging::init("info");

    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client { url } => {
            if let Err(e) = run_client(&url).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let server = Server::new(config.clone());

    server.set_subscribe_handler(|chan_id: u32, client_id: &ClientId| {
        info!(channel = chan_id, client = %client_id, "first subscriber");
    });
    server.set_unsubscribe_handler(|chan_id: u32, client_id: &ClientId| {
        info!(channel = chan_id, client = %client_id, "last subscriber left");
    });

    server.start(&config.server.host, config.server.port)?;

    let chan_id = server.add_channel(ChannelSpec {
        topic: "example_msg".to_string(),
        encoding: "json".to_string(),
        schema_name: "ExampleMsg".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "msg": { "type": "string" },
                "count": { "type": "number" },
            },
        })
        .to_string(),
        schema_encoding: None,
    });

    let mut count: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                count += 1;
                let payload = serde_json::json!({ "msg": "Hello!", "count": count }).to_string();
                let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
                server.broadcast_message(chan_id, now, payload.as_bytes());
            }
        }
    }

    server.stop().await;
    Ok(())
}

async fn run_client(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tungstenite::client::IntoClientRequest;
    use tungstenite::http::HeaderValue;
    use tungstenite::protocol::Message as WsMessage;

    use foxbridge_protocol::{
        decode_message_data, ClientMessage, ServerMessage, Subscription, SUBPROTOCOL,
    };

    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );
    let (mut ws_stream, response) = connect_async(request).await?;
    println!(
        "Connected, subprotocol: {:?}",
        response.headers().get("sec-websocket-protocol")
    );

    let mut next_sub_id: SubscriptionId = 0;
    while let Some(msg) = ws_stream.next().await {
        match msg? {
            WsMessage::Text(text) => {
                println!("Server: {text}");
                if let Ok(ServerMessage::Advertise { channels }) = serde_json::from_str(&text) {
                    // Subscribe to everything the server offers.
                    let subscriptions = channels
                        .iter()
                        .map(|channel| {
                            next_sub_id += 1;
                            Subscription {
                                id: next_sub_id,
                                channel_id: channel.id,
                            }
                        })
                        .collect::<Vec<_>>();
                    if !subscriptions.is_empty() {
                        let subscribe = ClientMessage::Subscribe { subscriptions };
                        ws_stream
                            .send(WsMessage::Text(serde_json::to_string(&subscribe)?.into()))
                            .await?;
                    }
                }
            }
            WsMessage::Binary(data) => match decode_message_data(&data) {
                Ok(decoded) => println!(
                    "Message on subscription {} at {}: {}",
                    decoded.subscription_id,
                    decoded.timestamp,
                    String::from_utf8_lossy(decoded.payload)
                ),
                Err(e) => eprintln!("Bad binary frame: {e}"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
