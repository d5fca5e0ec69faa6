//! WebSocket transport
//!
//! This module owns every piece of the server that touches a socket:
//! - listener setup with `SO_REUSEADDR` and a backlog of 128
//! - the accept loop, with optional TLS and graceful shutdown
//! - the subprotocol-gated HTTP upgrade: clients that do not offer
//!   `foxglove.websocket.v1` never reach the open state
//! - per-connection read and send loops that translate frames into broker
//!   operations
//!
//! Each connection runs two tasks: the read loop (this function) and a send
//! loop draining the client's outbound queue. Whichever observes the
//! disconnect first runs the broker cleanup; an atomic flag makes the
//! cleanup fire exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::{HeaderValue, StatusCode};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;

use foxbridge_client::{ClientInfo, OutboundQueue};
use foxbridge_protocol::{parse_client_message, ClientMessage, ProtocolError, SUBPROTOCOL};

use crate::engine::Broker;
use crate::error::ServerError;

/// Bind a listener with `SO_REUSEADDR` set and a backlog of 128.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept connections until shutdown is signalled, then start the close
/// handshake on every open connection.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
    tls: Option<TlsAcceptor>,
    send_buffer_limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let broker = broker.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => {
                                handle_connection(stream, peer, broker, send_buffer_limit).await;
                            }
                            Err(e) => info!(client = %peer, "TLS handshake failed: {e}"),
                        },
                        None => handle_connection(stream, peer, broker, send_buffer_limit).await,
                    }
                });
            }
        }
    }

    let broker = broker.lock().unwrap();
    for client in broker.clients.values() {
        let close = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "server shutdown".into(),
        }));
        if let Err(e) = client.sender.send_control(close) {
            debug!(client = %client.name, "could not queue close frame: {e}");
        }
    }
}

/// Select `foxglove.websocket.v1` if the client offered it, otherwise fail
/// the HTTP upgrade.
fn negotiate_subprotocol(
    peer: SocketAddr,
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim);
    for protocol in offered {
        if protocol == SUBPROTOCOL {
            response
                .headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));
            return Ok(response);
        }
    }

    info!(client = %peer, "rejecting client which did not declare support for subprotocol {SUBPROTOCOL}");
    let mut response =
        ErrorResponse::new(Some(format!("subprotocol {SUBPROTOCOL} is required")));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    Err(response)
}

pub(crate) async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    broker: Arc<Mutex<Broker>>,
    send_buffer_limit: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match accept_hdr_async(stream, |request: &Request, response: Response| {
        negotiate_subprotocol(peer, request, response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            info!(client = %peer, "websocket handshake failed: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let queue = OutboundQueue::new(tx, send_buffer_limit);
    let client = ClientInfo::new(peer.to_string(), queue.clone());
    let client_id = client.id.clone();
    {
        let mut broker = broker.lock().unwrap();
        broker.register_client(client);
    }

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let broker = broker.clone();
        let client_id = client_id.clone();
        let cleanup_called = cleanup_called.clone();
        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                let mut broker = broker.lock().unwrap();
                broker.cleanup_client(&client_id);
            }
        }
    };

    {
        let client_id = client_id.clone();
        let queue = queue.clone();
        let do_cleanup = do_cleanup.clone();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let frame_len = msg.len();
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(client = %client_id, "failed to write frame: {e}");
                    break;
                }
                queue.mark_sent(frame_len);
                if closing {
                    break;
                }
            }
            do_cleanup();
            debug!(client = %client_id, "send loop closed");
        });
    }

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client = %peer, "read error: {e}");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                let mut broker = broker.lock().unwrap();
                match parse_client_message(&text) {
                    Ok(ClientMessage::Subscribe { subscriptions }) => {
                        broker.handle_subscribe(&client_id, subscriptions);
                    }
                    Ok(ClientMessage::Unsubscribe { subscription_ids }) => {
                        broker.handle_unsubscribe(&client_id, &subscription_ids);
                    }
                    Err(ProtocolError::UnknownOp(op)) => {
                        broker.handle_unknown_op(&client_id, &op);
                    }
                    Err(err) => {
                        error!(
                            client = %peer,
                            "invalid client message: {err} | {}",
                            text.as_str().chars().take(100).collect::<String>()
                        );
                        broker.handle_malformed_message(&client_id, &err.to_string());
                    }
                }
            }
            WsMessage::Binary(_) => {
                debug!(client = %peer, "ignoring binary frame from client");
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    do_cleanup();
}
