//! Embedding API
//!
//! `Server` is the surface the application sees: construct it with settings,
//! start listening, add and remove channels, broadcast messages, and stop.
//! All methods delegate to the shared broker; the listener lives in a
//! background task owned by this struct.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use foxbridge_client::ClientId;
use foxbridge_config::Settings;
use foxbridge_protocol::{ChannelId, ChannelSpec};

use crate::engine::Broker;
use crate::error::ServerError;
use crate::{tls, websocket};

struct ListenTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct Server {
    settings: Settings,
    broker: Arc<Mutex<Broker>>,
    listen: Mutex<Option<ListenTask>>,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        let broker = Broker::new(settings.server.name.clone());
        Self {
            settings,
            broker: Arc::new(Mutex::new(broker)),
            listen: Mutex::new(None),
        }
    }

    /// Begin accepting connections on `host:port`.
    ///
    /// Idempotent: calling `start` while already listening returns the
    /// existing bound address. Starting again after `stop` is permitted.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        let mut listen = self.listen.lock().unwrap();
        if let Some(task) = listen.as_ref() {
            return Ok(task.local_addr);
        }

        let addr = resolve_addr(host, port)?;
        let listener = websocket::bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let acceptor = if self.settings.tls.enabled {
            let (Some(cert_file), Some(key_file)) = (
                self.settings.tls.cert_file.as_deref(),
                self.settings.tls.key_file.as_deref(),
            ) else {
                return Err(ServerError::Tls(
                    "tls.enabled is set but cert_file or key_file is missing".to_string(),
                ));
            };
            Some(tls::build_acceptor(cert_file, key_file)?)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(websocket::run_accept_loop(
            listener,
            self.broker.clone(),
            acceptor,
            self.settings.server.send_buffer_limit_bytes,
            shutdown_rx,
        ));
        info!(%local_addr, tls = self.settings.tls.enabled, "server listening");

        *listen = Some(ListenTask {
            shutdown: shutdown_tx,
            handle,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, start the close handshake (`going_away`) on every open
    /// connection, and wait for the accept task to finish. A no-op when the
    /// server is not listening.
    pub async fn stop(&self) {
        let task = self.listen.lock().unwrap().take();
        let Some(task) = task else { return };
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            error!("accept task failed: {e}");
        }
        info!("server stopped");
    }

    pub fn add_channel(&self, spec: ChannelSpec) -> ChannelId {
        self.broker.lock().unwrap().add_channel(spec)
    }

    pub fn add_channels(&self, specs: Vec<ChannelSpec>) -> Vec<ChannelId> {
        self.broker.lock().unwrap().add_channels(specs)
    }

    pub fn remove_channel(&self, id: ChannelId) {
        self.broker.lock().unwrap().remove_channel(id);
    }

    pub fn remove_channels(&self, ids: &[ChannelId]) {
        self.broker.lock().unwrap().remove_channels(ids);
    }

    /// Broadcast one timestamped payload to every subscription covering the
    /// channel. Timestamps are nanoseconds since an epoch of the
    /// application's choosing; the server treats them as opaque.
    pub fn broadcast_message(&self, chan_id: ChannelId, timestamp: u64, payload: &[u8]) {
        self.broker
            .lock()
            .unwrap()
            .broadcast_message(chan_id, timestamp, payload);
    }

    pub fn set_subscribe_handler(
        &self,
        handler: impl FnMut(ChannelId, &ClientId) + Send + 'static,
    ) {
        self.broker.lock().unwrap().set_subscribe_handler(handler);
    }

    pub fn set_unsubscribe_handler(
        &self,
        handler: impl FnMut(ChannelId, &ClientId) + Send + 'static,
    ) {
        self.broker.lock().unwrap().set_unsubscribe_handler(handler);
    }

    pub fn remote_endpoint(&self, client_id: &ClientId) -> Option<String> {
        self.broker
            .lock()
            .unwrap()
            .remote_endpoint(client_id)
            .map(str::to_owned)
    }

    /// Access to the shared broker, mainly for tests and advanced embeddings.
    pub fn broker(&self) -> Arc<Mutex<Broker>> {
        self.broker.clone()
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ServerError::InvalidAddr(format!("{host}:{port}")))
}
