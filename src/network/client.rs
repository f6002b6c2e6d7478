//! CardNet Client
//!
//! Connects to a CardNet server and dispatches what it sends to a handler.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionOwner};
use crate::config::ClientConfig;
use crate::protocol::{
    check_payload, CodecError, DisconnectMessage, ForwardedMessage, Message, Payload, PeerId,
    CLIENT_FAREWELL,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Rejected payload: {0}")]
    Codec(#[from] CodecError),

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A payload delivered to the client
#[derive(Debug)]
pub enum Incoming<T> {
    /// Sent by the server itself
    Application(Arc<T>),
    /// Sent by another peer and forwarded by the server
    Forwarded(ForwardedMessage<T>),
}

/// Application callbacks, run one at a time by the client's dispatch task
#[async_trait]
pub trait ClientHandler<T: Payload>: Send + 'static {
    async fn on_message(&mut self, client: &Client<T>, message: Incoming<T>);

    async fn on_peer_connected(&mut self, _client: &Client<T>, _peer_id: PeerId) {}

    async fn on_peer_disconnected(&mut self, _client: &Client<T>, _peer_id: PeerId) {}

    /// The server sent a disconnect. No callbacks follow.
    async fn on_server_shutdown(&mut self, _client: &Client<T>, text: String) {
        tracing::info!("Server closed the connection: {}", text);
    }

    /// The connection failed. No callbacks follow.
    async fn on_connection_error(&mut self, _client: &Client<T>, reason: String) {
        tracing::warn!("Connection to server lost: {}", reason);
    }
}

enum Event<T> {
    Message(Incoming<T>),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    ServerShutdown(String),
    ConnectionError(String),
}

struct Inner<T> {
    peer_id: PeerId,
    server_addr: SocketAddr,
    handle: ConnectionHandle<T>,
    autoreset: Arc<AtomicBool>,
    /// Roster from the latest status message
    roster: RwLock<BTreeSet<PeerId>>,
    events: mpsc::UnboundedSender<Event<T>>,
}

#[async_trait]
impl<T: Payload> ConnectionOwner<T> for Inner<T> {
    async fn on_message(&self, _peer_id: PeerId, message: Message<T>) {
        let event = match message {
            Message::Status(status) => {
                *self.roster.write().await = status.peers;
                if status.connecting {
                    Event::PeerConnected(status.peer_id)
                } else {
                    Event::PeerDisconnected(status.peer_id)
                }
            }
            Message::Application(payload) => Event::Message(Incoming::Application(payload)),
            Message::Forwarded(forwarded) => Event::Message(Incoming::Forwarded(forwarded)),
            other => {
                tracing::warn!("Unexpected {} from server, dropping", other.kind());
                return;
            }
        };
        let _ = self.events.send(event);
    }

    async fn on_disconnect(&self, _peer_id: PeerId, text: String) {
        let _ = self.events.send(Event::ServerShutdown(text));
    }

    async fn on_error(&self, _peer_id: PeerId, reason: String) {
        let _ = self.events.send(Event::ConnectionError(reason));
    }
}

/// CardNet Client
pub struct Client<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> Client<T> {
    /// Connect to a server and complete the handshake
    pub async fn connect<H: ClientHandler<T>>(server_addr: SocketAddr, handler: H) -> ClientResult<Self> {
        Self::establish(server_addr, false, handler).await
    }

    /// Connect using the `[client]` section of the configuration
    pub async fn connect_with<H: ClientHandler<T>>(config: &ClientConfig, handler: H) -> ClientResult<Self> {
        let server_addr = super::resolve_host(&config.host, config.port).await?;
        Self::establish(server_addr, config.autoreset, handler).await
    }

    async fn establish<H: ClientHandler<T>>(
        server_addr: SocketAddr,
        autoreset: bool,
        handler: H,
    ) -> ClientResult<Self> {
        tracing::info!("Connecting to {}", server_addr);

        let mut conn = Connection::connect(server_addr).await?;
        let peer_id = conn.handshake_client().await?;

        let endpoint = conn.into_endpoint(peer_id);
        let handle = endpoint.handle().clone();
        handle.mark_open();

        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            peer_id,
            server_addr,
            handle,
            autoreset: Arc::new(AtomicBool::new(autoreset)),
            roster: RwLock::new(BTreeSet::new()),
            events,
        });
        endpoint.spawn(Arc::clone(&inner), Arc::clone(&inner.autoreset));

        let client = Self { inner };
        tokio::spawn(dispatch_loop(client.clone(), handler, events_rx));

        Ok(client)
    }

    /// The id the server assigned during the handshake
    pub fn id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Queue a payload for the server
    pub fn send(&self, payload: impl Into<Arc<T>>) -> ClientResult<()> {
        let payload = payload.into();
        check_payload(payload.as_ref())?;
        self.enqueue(Message::Application(payload))
    }

    /// Tell the server we are leaving. Anything still queued is dropped.
    pub fn disconnect(&self) -> ClientResult<()> {
        tracing::info!("Disconnecting from {}", self.inner.server_addr);
        self.enqueue(Message::Disconnect(DisconnectMessage::new(CLIENT_FAREWELL)))
    }

    /// Roster from the most recent status message, ascending
    pub async fn connected_peers(&self) -> BTreeSet<PeerId> {
        self.inner.roster.read().await.clone()
    }

    /// Clear payload memoisation on the connection to the server
    pub fn reset_output(&self) -> ClientResult<()> {
        self.enqueue(Message::Reset)
    }

    pub fn set_autoreset(&self, enabled: bool) {
        self.inner.autoreset.store(enabled, Ordering::Relaxed);
    }

    pub fn autoreset(&self) -> bool {
        self.inner.autoreset.load(Ordering::Relaxed)
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.inner.handle.is_open()
    }

    /// Wait until the connection has been released
    pub async fn closed(&self) {
        self.inner.handle.closed().await
    }

    fn enqueue(&self, message: Message<T>) -> ClientResult<()> {
        self.inner.handle.enqueue(message).map_err(|e| match e {
            ConnectionError::Closed => ClientError::NotConnected,
            other => ClientError::Connection(other),
        })
    }
}

async fn dispatch_loop<T: Payload, H: ClientHandler<T>>(
    client: Client<T>,
    mut handler: H,
    mut events: mpsc::UnboundedReceiver<Event<T>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = client.closed() => break,
        };
        dispatch(&mut handler, &client, event).await;
    }

    // Whatever the receiver queued before the close
    while let Ok(event) = events.try_recv() {
        dispatch(&mut handler, &client, event).await;
    }

    tracing::debug!("Client {} dispatch task stopped", client.id());
}

async fn dispatch<T: Payload, H: ClientHandler<T>>(handler: &mut H, client: &Client<T>, event: Event<T>) {
    match event {
        Event::Message(message) => handler.on_message(client, message).await,
        Event::PeerConnected(peer_id) => handler.on_peer_connected(client, peer_id).await,
        Event::PeerDisconnected(peer_id) => handler.on_peer_disconnected(client, peer_id).await,
        Event::ServerShutdown(text) => handler.on_server_shutdown(client, text).await,
        Event::ConnectionError(reason) => handler.on_connection_error(client, reason).await,
    }
}
