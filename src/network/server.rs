//! CardNet Server
//!
//! The server accepts connections from players, keeps the roster and funnels
//! every inbound payload through a single dispatch task.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::connection::{Connection, ConnectionError, ConnectionOwner, ConnectionResult};
use super::raised;
use super::registry::Registry;
use crate::config::ServerConfig;
use crate::protocol::{
    check_payload, CodecError, DisconnectMessage, ForwardedMessage, Message, Payload, PeerId,
    SERVER_SHUTDOWN,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Rejected payload: {0}")]
    Codec(#[from] CodecError),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Application callbacks, run one at a time by the server's dispatch task.
///
/// The dispatch task owns the handler, so it can keep game state in `self`
/// without locking.
#[async_trait]
pub trait ServerHandler<T: Payload>: Send + 'static {
    /// An application payload arrived from `sender`.
    ///
    /// The default forwards it to every peer, tagged with the sender's id.
    async fn on_message(&mut self, server: &Server<T>, sender: PeerId, payload: Arc<T>) {
        if let Err(e) = server.forward_to_all(sender, payload).await {
            tracing::warn!("Failed to forward payload from peer {}: {}", sender, e);
        }
    }

    async fn on_peer_connected(&mut self, _server: &Server<T>, _peer_id: PeerId) {}

    async fn on_peer_disconnected(&mut self, _server: &Server<T>, _peer_id: PeerId) {}
}

/// Handler that keeps every default: forward payloads, ignore roster changes
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardingHandler;

#[async_trait]
impl<T: Payload> ServerHandler<T> for ForwardingHandler {}

/// Work items for the dispatch task
enum Event<T> {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(PeerId, Arc<T>),
}

struct Shared<T> {
    registry: Registry<T>,
    events: mpsc::UnboundedSender<Event<T>>,
    autoreset: Arc<AtomicBool>,
    /// Raised to ask the accept task to drop the listener
    stop_listening: watch::Sender<bool>,
    /// True while the listener is open; cleared by the accept task on exit
    listening: watch::Sender<bool>,
    /// Raised once by `shutdown`
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl<T: Payload> Shared<T> {
    async fn remove_peer(&self, peer_id: PeerId) {
        if self.registry.deregister(peer_id).await.is_some() {
            let _ = self.events.send(Event::Disconnected(peer_id));
        }
    }
}

#[async_trait]
impl<T: Payload> ConnectionOwner<T> for Shared<T> {
    async fn on_message(&self, peer_id: PeerId, message: Message<T>) {
        match message {
            Message::Application(payload) => {
                // Under the registry lock, so nothing is queued behind the
                // peer's Disconnected event.
                let queued = self
                    .registry
                    .with_peer(peer_id, || {
                        let _ = self.events.send(Event::Message(peer_id, payload));
                    })
                    .await;
                if queued.is_none() {
                    tracing::debug!("Dropping payload from departed peer {}", peer_id);
                }
            }
            other => {
                tracing::warn!("Unexpected {} from peer {}, dropping", other.kind(), peer_id);
            }
        }
    }

    async fn on_disconnect(&self, peer_id: PeerId, _text: String) {
        self.remove_peer(peer_id).await;
    }

    async fn on_error(&self, peer_id: PeerId, _reason: String) {
        self.remove_peer(peer_id).await;
    }
}

/// CardNet Server
pub struct Server<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Payload> Server<T> {
    /// Bind the listening socket and start the accept and dispatch tasks
    pub async fn bind<H: ServerHandler<T>>(config: &ServerConfig, handler: H) -> ServerResult<Self> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Registry::new(),
            events,
            autoreset: Arc::new(AtomicBool::new(config.autoreset)),
            stop_listening: watch::channel(false).0,
            listening: watch::channel(true).0,
            shutdown: watch::channel(false).0,
            local_addr,
        });
        let server = Self { shared };

        tokio::spawn(accept_loop(listener, Arc::clone(&server.shared)));
        tokio::spawn(dispatch_loop(server.clone(), handler, events_rx));

        Ok(server)
    }

    /// The address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Queue a payload for every registered peer.
    ///
    /// A peer whose connection is failing is skipped; its own error path
    /// removes it from the roster.
    pub async fn send_to_all(&self, payload: impl Into<Arc<T>>) -> ServerResult<()> {
        let payload = payload.into();
        check_payload(payload.as_ref())?;
        let delivered = self
            .shared
            .registry
            .broadcast(Message::Application(payload))
            .await;
        tracing::trace!("Payload queued for {} peers", delivered);
        Ok(())
    }

    /// Queue a payload for one peer. Ok(false) if the id is not registered.
    pub async fn send_to_one(&self, peer_id: PeerId, payload: impl Into<Arc<T>>) -> ServerResult<bool> {
        let payload = payload.into();
        check_payload(payload.as_ref())?;
        Ok(self
            .shared
            .registry
            .send_to(peer_id, Message::Application(payload))
            .await)
    }

    /// Send a payload to every peer, tagged with the id it came from
    pub async fn forward_to_all(&self, sender_id: PeerId, payload: Arc<T>) -> ServerResult<()> {
        check_payload(payload.as_ref())?;
        self.shared
            .registry
            .broadcast(Message::Forwarded(ForwardedMessage { sender_id, payload }))
            .await;
        Ok(())
    }

    /// Ids of every open connection, ascending
    pub async fn player_list(&self) -> BTreeSet<PeerId> {
        self.shared.registry.peer_ids().await
    }

    /// Clear payload memoisation on every connection
    pub async fn reset_output(&self) {
        self.shared.registry.broadcast(Message::Reset).await;
    }

    pub fn set_autoreset(&self, enabled: bool) {
        self.shared.autoreset.store(enabled, Ordering::Relaxed);
    }

    pub fn autoreset(&self) -> bool {
        self.shared.autoreset.load(Ordering::Relaxed)
    }

    /// Close the listening socket. Peers already connected are unaffected.
    ///
    /// Returns once the listener has been dropped.
    pub async fn stop_accepting(&self) {
        self.shared.stop_listening.send_replace(true);
        let mut listening = self.shared.listening.subscribe();
        let _ = listening.wait_for(|open| !*open).await;
    }

    pub fn is_accepting(&self) -> bool {
        *self.shared.listening.borrow()
    }

    /// Stop accepting, send every peer a shutdown notice and stop dispatching.
    ///
    /// Peers are dropped from the roster without a status broadcast and no
    /// handler callbacks run afterwards.
    pub async fn shutdown(&self) {
        tracing::info!("Server shutdown requested");
        self.shared.shutdown.send_replace(true);
        self.stop_accepting().await;

        for handle in self.shared.registry.drain().await {
            let notice = Message::Disconnect(DisconnectMessage::new(SERVER_SHUTDOWN));
            if let Err(e) = handle.enqueue(notice) {
                tracing::debug!("Peer {} already closing: {}", handle.peer_id(), e);
            }
        }
    }
}

async fn accept_loop<T: Payload>(listener: TcpListener, shared: Arc<Shared<T>>) {
    let stop = raised(shared.stop_listening.subscribe());
    tokio::pin!(stop);

    loop {
        let (stream, addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            },
            _ = &mut stop => break,
        };

        tracing::info!("New connection from {}", addr);
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = accept_peer(stream, addr, shared).await {
                tracing::warn!("Rejected connection from {}: {}", addr, e);
            }
        });
    }

    drop(listener);
    shared.listening.send_replace(false);
    tracing::info!("Server on {} stopped accepting connections", shared.local_addr);
}

/// Server side of the handshake. The peer only becomes visible once the
/// welcome has been written and it is registered.
///
/// A peer that finishes the handshake after `shutdown` drained the registry
/// is told the server is shutting down and never registered.
async fn accept_peer<T: Payload>(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared<T>>,
) -> ConnectionResult<()> {
    let mut conn = Connection::new(stream, addr);
    conn.expect_hello().await?;

    let peer_id = shared.registry.allocate_id().await;
    conn.send_welcome(peer_id).await?;

    let endpoint = conn.into_endpoint(peer_id);
    let handle = endpoint.handle().clone();
    let autoreset = Arc::clone(&shared.autoreset);

    if shared.registry.register(handle.clone()).await.is_some() {
        let _ = shared.events.send(Event::Connected(peer_id));
    } else {
        tracing::info!("Turning away peer {}, server is shutting down", peer_id);
        handle.mark_open();
        handle.enqueue(Message::Disconnect(DisconnectMessage::new(SERVER_SHUTDOWN)))?;
    }

    endpoint.spawn(shared, autoreset);
    Ok(())
}

async fn dispatch_loop<T: Payload, H: ServerHandler<T>>(
    server: Server<T>,
    mut handler: H,
    mut events: mpsc::UnboundedReceiver<Event<T>>,
) {
    let stop = raised(server.shared.shutdown.subscribe());
    tokio::pin!(stop);

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut stop => break,
        };

        match event {
            Event::Connected(peer_id) => handler.on_peer_connected(&server, peer_id).await,
            Event::Disconnected(peer_id) => handler.on_peer_disconnected(&server, peer_id).await,
            Event::Message(peer_id, payload) => handler.on_message(&server, peer_id, payload).await,
        }
    }

    tracing::debug!("Dispatch task for {} stopped", server.local_addr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ACKNOWLEDGMENT, HELLO_TOKEN};
    use std::time::Duration;

    /// Records every payload the dispatch task hands to the handler
    struct Recording(mpsc::UnboundedSender<(PeerId, String)>);

    #[async_trait]
    impl ServerHandler<String> for Recording {
        async fn on_message(&mut self, _server: &Server<String>, sender: PeerId, payload: Arc<String>) {
            let _ = self.0.send((sender, payload.as_ref().clone()));
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            autoreset: false,
        }
    }

    async fn raw_client(server: &Server<String>) -> Connection<String> {
        Connection::connect(server.local_addr()).await.unwrap()
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.is_accepting());
        assert!(server.player_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..local_config()
        };
        let result = Server::<String>::bind(&taken, ForwardingHandler).await;
        assert!(matches!(result, Err(ServerError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_handshake_assigns_increasing_ids() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();

        let mut first = raw_client(&server).await;
        let mut second = raw_client(&server).await;
        let a = first.handshake_client().await.unwrap();
        let b = second.handshake_client().await.unwrap();

        let mut ids = [a, b];
        ids.sort();
        assert_eq!(ids, [PeerId::new(1), PeerId::new(2)]);
    }

    #[tokio::test]
    async fn test_bad_greeting_is_never_registered() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();

        let mut intruder = raw_client(&server).await;
        intruder
            .send(&Message::Hello("Hello Client".to_string()))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(5), intruder.recv())
            .await
            .unwrap()
            .map(|frame| frame.is_none())
            .unwrap_or(true));
        assert!(server.player_list().await.is_empty());

        let mut player = raw_client(&server).await;
        player
            .send(&Message::Hello(HELLO_TOKEN.to_string()))
            .await
            .unwrap();
        let frame = player.recv().await.unwrap().unwrap();
        assert!(matches!(frame.message, Message::Welcome(id) if id == PeerId::new(1)));
    }

    #[tokio::test]
    async fn test_silent_connection_is_never_registered() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();

        let _mute = raw_client(&server).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(server.player_list().await.is_empty());

        let mut player = raw_client(&server).await;
        let id = player.handshake_client().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.player_list().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.player_list().await, BTreeSet::from([id]));
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_shutdown_is_turned_away() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();
        server.shutdown().await;

        // The listener is gone, so hand the late socket to the accept path directly
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (late, accepted) = tokio::join!(Connection::<String>::connect(addr), listener.accept());
        let mut late = late.unwrap();
        let (stream, remote) = accepted.unwrap();
        let accepting = tokio::spawn(accept_peer(stream, remote, Arc::clone(&server.shared)));

        late.handshake_client().await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), late.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame.message {
            Message::Disconnect(msg) => assert_eq!(msg.text, SERVER_SHUTDOWN),
            other => panic!("expected Disconnect, got {}", other.kind()),
        }
        late.send(&Message::Acknowledge(ACKNOWLEDGMENT.to_string()))
            .await
            .unwrap();

        assert!(accepting.await.unwrap().is_ok());
        assert!(server.player_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_payload_from_departed_peer_is_not_dispatched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server: Server<String> = Server::bind(&local_config(), Recording(tx)).await.unwrap();

        let mut gone = raw_client(&server).await;
        let gone_id = gone.handshake_client().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.player_list().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Removed from the roster while its receiver still holds a payload
        server.shared.remove_peer(gone_id).await;
        server
            .shared
            .on_message(gone_id, Message::Application(Arc::new("stale".to_string())))
            .await;
        server
            .shared
            .on_message(PeerId::new(99), Message::Application(Arc::new("ghost".to_string())))
            .await;

        let mut player = raw_client(&server).await;
        let player_id = player.handshake_client().await.unwrap();
        player
            .send(&Message::Application(Arc::new("fresh".to_string())))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, (player_id, "fresh".to_string()));
    }

    #[tokio::test]
    async fn test_send_to_one_unknown_peer() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();
        let sent = server
            .send_to_one(PeerId::new(42), "nobody".to_string())
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_autoreset_toggle() {
        let config = ServerConfig {
            autoreset: true,
            ..local_config()
        };
        let server: Server<String> = Server::bind(&config, ForwardingHandler).await.unwrap();
        assert!(server.autoreset());
        server.set_autoreset(false);
        assert!(!server.autoreset());
    }

    #[tokio::test]
    async fn test_stop_accepting_closes_listener() {
        let server: Server<String> = Server::bind(&local_config(), ForwardingHandler).await.unwrap();
        let addr = server.local_addr();

        server.stop_accepting().await;
        assert!(!server.is_accepting());

        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            let mut conn = Connection::<String>::connect(addr).await?;
            conn.handshake_client().await
        })
        .await
        .unwrap();
        assert!(refused.is_err());
    }
}
