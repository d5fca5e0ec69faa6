//! foxbridge_client
//!
//! Connection-scoped state kept by the server for each WebSocket client:
//! the client's identity, the outbound frame queue, and the two-way
//! subscription bookkeeping used to route broadcasts.
//!
//! This crate is used by the transport and broker layers; it performs no
//! network I/O itself.

pub mod connection;

pub use connection::{ClientId, ClientInfo, EnqueueError, OutboundQueue};
