use thiserror::Error;

/// Errors surfaced to the embedding application by `Server::start`.
///
/// Protocol-level client errors never appear here; they are answered with
/// `status` messages or logged, and are not fatal to the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve bind address {0}")]
    InvalidAddr(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}
