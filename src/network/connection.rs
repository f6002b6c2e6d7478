//! Connection handling for CardNet
//!
//! Manages individual peer connections, including:
//! - Message encoding/decoding
//! - The hello/welcome handshake
//! - Connection state management
//! - One sender task and one receiver task per open connection

use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::protocol::{
    CodecError, Decoder, Encoder, Frame, Message, Payload, PeerId, ACKNOWLEDGMENT, HELLO_TOKEN,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection established, handshake not started
    Connecting,
    /// Hello/welcome exchange in progress
    Handshaking,
    /// Handshake complete, ready for communication
    Open,
    /// A disconnect was sent or received, or an I/O error occurred
    Closing,
    /// Socket released, worker tasks stopping
    Closed,
}

/// Read half of a connection with its decoder
pub struct FrameReader<T> {
    half: OwnedReadHalf,
    decoder: Decoder<T>,
    read_buf: BytesMut,
}

impl<T: DeserializeOwned> FrameReader<T> {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Receive the next frame. Returns None on a clean close between frames.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame<T>>> {
        loop {
            // Try to decode a message from the buffer
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            // Read more data
            let mut buf = [0u8; 4096];
            let n = self.half.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
        }
    }
}

/// Write half of a connection with its encoder
pub struct FrameWriter<T> {
    half: OwnedWriteHalf,
    encoder: Encoder<T>,
    write_buf: BytesMut,
}

impl<T: Serialize> FrameWriter<T> {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            half,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Send a message and flush
    pub async fn send(&mut self, message: &Message<T>) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;
        self.flush_buf().await
    }

    /// Reset payload memoisation, then send a message, in one write
    pub async fn send_fresh(&mut self, message: &Message<T>) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.reset(&mut self.write_buf)?;
        self.encoder.encode(message, &mut self.write_buf)?;
        self.flush_buf().await
    }

    /// Shut down the write direction of the socket
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.half.shutdown().await {
            tracing::debug!("Shutdown of write half failed: {}", e);
        }
    }

    async fn flush_buf(&mut self) -> ConnectionResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.half.write_all(&self.write_buf).await?;
        self.half.flush().await?;
        Ok(())
    }
}

/// Receives what a connection's worker tasks produce.
///
/// Each endpoint calls at most one of `on_disconnect` / `on_error`, and only
/// while it is leaving the open state.
#[async_trait]
pub trait ConnectionOwner<T: Payload>: Send + Sync + 'static {
    /// Any message other than a disconnect, received while open
    async fn on_message(&self, peer_id: PeerId, message: Message<T>);

    /// The peer sent a disconnect. The endpoint is closing and will acknowledge.
    async fn on_disconnect(&self, peer_id: PeerId, text: String);

    /// Reading or writing failed while open. The endpoint closes right after.
    async fn on_error(&self, peer_id: PeerId, reason: String);
}

/// A connection that has not finished its handshake yet
pub struct Connection<T> {
    /// Remote peer address
    remote_addr: SocketAddr,
    reader: FrameReader<T>,
    writer: FrameWriter<T>,
    state: ConnectionState,
}

impl<T: Payload> Connection<T> {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            remote_addr,
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            state: ConnectionState::Connecting,
        }
    }

    /// Open a TCP connection to a server
    pub async fn connect(addr: SocketAddr) -> ConnectionResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, addr))
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Send a message directly, bypassing any outgoing queue
    pub async fn send(&mut self, message: &Message<T>) -> ConnectionResult<()> {
        self.writer.send(message).await
    }

    /// Receive the next frame directly
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame<T>>> {
        self.reader.recv().await
    }

    /// Perform the client-side handshake and return the assigned peer id
    pub async fn handshake_client(&mut self) -> ConnectionResult<PeerId> {
        self.state = ConnectionState::Handshaking;
        self.writer.send(&Message::Hello(HELLO_TOKEN.to_string())).await?;

        let frame = self.reader.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        match frame.message {
            Message::Welcome(peer_id) if peer_id >= PeerId::FIRST => {
                tracing::info!(
                    "Handshake complete with {}, assigned peer id {}",
                    self.remote_addr,
                    peer_id
                );
                Ok(peer_id)
            }
            other => Err(ConnectionError::HandshakeFailed(format!(
                "Illegal response from server: {}",
                other.kind()
            ))),
        }
    }

    /// Server side, first half: wait for the client's hello
    pub async fn expect_hello(&mut self) -> ConnectionResult<()> {
        self.state = ConnectionState::Handshaking;

        let frame = self.reader.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        match frame.message {
            Message::Hello(token) if token == HELLO_TOKEN => Ok(()),
            Message::Hello(token) => Err(ConnectionError::HandshakeFailed(format!(
                "Incorrect hello string received from client: {:?}",
                token
            ))),
            other => Err(ConnectionError::HandshakeFailed(format!(
                "Expected Hello message, got {}",
                other.kind()
            ))),
        }
    }

    /// Server side, second half: tell the client its peer id
    pub async fn send_welcome(&mut self, peer_id: PeerId) -> ConnectionResult<()> {
        self.writer.send(&Message::Welcome(peer_id)).await?;
        tracing::info!("Handshake complete with {} as peer {}", self.remote_addr, peer_id);
        Ok(())
    }

    /// Hand the socket over to an endpoint. The endpoint starts out handshaking;
    /// its owner marks it open once the peer is accounted for.
    pub fn into_endpoint(self, peer_id: PeerId) -> Endpoint<T> {
        let (handle, outgoing) = ConnectionHandle::new(peer_id);
        Endpoint {
            remote_addr: self.remote_addr,
            reader: self.reader,
            writer: self.writer,
            outgoing,
            handle,
        }
    }
}

/// A handshaken connection whose worker tasks have not been started
pub struct Endpoint<T> {
    remote_addr: SocketAddr,
    reader: FrameReader<T>,
    writer: FrameWriter<T>,
    outgoing: mpsc::UnboundedReceiver<Message<T>>,
    handle: ConnectionHandle<T>,
}

impl<T: Payload> Endpoint<T> {
    pub fn handle(&self) -> &ConnectionHandle<T> {
        &self.handle
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Start the sender and receiver tasks.
    ///
    /// `autoreset` is read before every payload write, so it can be toggled live.
    pub fn spawn<O: ConnectionOwner<T>>(self, owner: Arc<O>, autoreset: Arc<AtomicBool>) {
        tracing::debug!(
            "Starting workers for peer {} ({})",
            self.handle.peer_id(),
            self.remote_addr
        );
        tokio::spawn(send_loop(
            self.writer,
            self.outgoing,
            self.handle.clone(),
            Arc::clone(&owner),
            autoreset,
        ));
        tokio::spawn(receive_loop(self.reader, self.handle, owner));
    }
}

/// A handle for queueing messages on a connection
pub struct ConnectionHandle<T> {
    peer_id: PeerId,
    outgoing: mpsc::UnboundedSender<Message<T>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl<T> Clone for ConnectionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            peer_id: self.peer_id,
            outgoing: self.outgoing.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> ConnectionHandle<T> {
    pub(crate) fn new(peer_id: PeerId) -> (Self, mpsc::UnboundedReceiver<Message<T>>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Handshaking);
        let handle = Self {
            peer_id,
            outgoing,
            state: Arc::new(state),
        };
        (handle, rx)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Append a message to the outgoing queue. Never blocks.
    ///
    /// A disconnect moves the endpoint to closing; every message still queued
    /// ahead of it is dropped by the sender task.
    pub fn enqueue(&self, message: Message<T>) -> ConnectionResult<()> {
        if matches!(message, Message::Disconnect(_)) {
            if !self.transition(ConnectionState::Open, ConnectionState::Closing) {
                return Err(ConnectionError::Closed);
            }
        } else if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        self.outgoing
            .send(message)
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Close the connection. Idempotent; interrupts both worker tasks.
    pub fn close(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if changed {
            tracing::debug!("Connection with peer {} closed", self.peer_id);
        }
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            let done = *state.borrow_and_update() == ConnectionState::Closed;
            if done || state.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Handshaking, ConnectionState::Open)
    }

    pub(crate) fn begin_closing(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
    }

    fn acknowledge(&self) {
        let _ = self
            .outgoing
            .send(Message::Acknowledge(ACKNOWLEDGMENT.to_string()));
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Leave the open state because of an I/O failure, then close
async fn fail<T: Payload, O: ConnectionOwner<T>>(
    handle: &ConnectionHandle<T>,
    owner: &O,
    reason: String,
) {
    if handle.begin_closing() {
        tracing::warn!("Connection with peer {} failed: {}", handle.peer_id(), reason);
        owner.on_error(handle.peer_id(), reason).await;
    } else {
        tracing::debug!("Peer {} went away while closing: {}", handle.peer_id(), reason);
    }
    handle.close();
}

async fn send_loop<T: Payload, O: ConnectionOwner<T>>(
    mut writer: FrameWriter<T>,
    mut outgoing: mpsc::UnboundedReceiver<Message<T>>,
    handle: ConnectionHandle<T>,
    owner: Arc<O>,
    autoreset: Arc<AtomicBool>,
) {
    let peer_id = handle.peer_id();

    loop {
        let message = tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = handle.closed() => break,
        };

        match handle.state() {
            ConnectionState::Open => {}
            ConnectionState::Closing if message.is_terminal() => {}
            _ => {
                tracing::trace!("Dropping {} for peer {} while closing", message.kind(), peer_id);
                continue;
            }
        }

        let result = if message.carries_payload() && autoreset.load(Ordering::Relaxed) {
            writer.send_fresh(&message).await
        } else {
            writer.send(&message).await
        };

        if let Err(e) = result {
            fail(&handle, owner.as_ref(), format!("Error while sending data: {}", e)).await;
            break;
        }

        match message {
            Message::Disconnect(_) => {
                // The receiver finishes once the acknowledgment (or EOF) arrives.
                writer.shutdown().await;
                break;
            }
            Message::Acknowledge(_) => {
                handle.close();
                break;
            }
            _ => {}
        }
    }
}

async fn receive_loop<T: Payload, O: ConnectionOwner<T>>(
    mut reader: FrameReader<T>,
    handle: ConnectionHandle<T>,
    owner: Arc<O>,
) {
    let peer_id = handle.peer_id();

    loop {
        let received = tokio::select! {
            received = reader.recv() => received,
            _ = handle.closed() => break,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                fail(&handle, owner.as_ref(), "Connection closed by peer".to_string()).await;
                break;
            }
            Err(e) => {
                fail(&handle, owner.as_ref(), format!("Error while reading data: {}", e)).await;
                break;
            }
        };

        match frame.message {
            Message::Disconnect(msg) => {
                if handle.begin_closing() {
                    tracing::info!("Peer {} disconnected: {}", peer_id, msg.text);
                    owner.on_disconnect(peer_id, msg.text).await;
                    handle.acknowledge();
                } else {
                    handle.close();
                }
                break;
            }
            Message::Acknowledge(text) if !handle.is_open() => {
                tracing::debug!("Peer {} acknowledged disconnect: {}", peer_id, text);
                handle.close();
                break;
            }
            Message::Reset => tracing::trace!("Peer {} reset its output stream", peer_id),
            message if handle.is_open() => owner.on_message(peer_id, message).await,
            message => tracing::debug!(
                "Dropping {} from peer {} while closing",
                message.kind(),
                peer_id
            ),
        }
    }
}
