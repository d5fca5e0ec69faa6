//! foxbridge_server
//!
//! A WebSocket server implementing the `foxglove.websocket.v1` pub/sub
//! protocol. An embedding application advertises channels, broadcasts
//! timestamped payloads, and receives edge-triggered notifications when the
//! first client subscribes to a channel or the last one leaves.
//!
//! Layout:
//! - `engine`: the broker holding the channel registry, the client table and
//!   the fan-out path; all state behind one `Arc<Mutex<_>>`
//! - `websocket`: listener setup, subprotocol-gated handshake, per-connection
//!   read and send loops
//! - `tls`: optional rustls acceptor for the listener
//! - `server`: the embedding facade tying the pieces together
//!
//! Public types:
//! - `Server`: construct, `start`, `stop`, add/remove channels, broadcast.
//! - `Broker`: the underlying state machine, usable directly in tests.

pub mod engine;
pub mod error;
pub mod server;
pub mod tls;
pub mod websocket;

pub use engine::{Broker, SubscriptionHandler};
pub use error::ServerError;
pub use foxbridge_client::ClientId;
pub use server::Server;

#[cfg(test)]
mod tests;
