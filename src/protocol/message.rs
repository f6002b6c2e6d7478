//! Protocol message definitions
//!
//! Control messages carry no game semantics. Application payloads are opaque
//! values of the caller's type `T` and always travel behind an `Arc` so the
//! codec can recognise a resent object.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Bounds every application payload type must satisfy.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Server-assigned identity of a connected client.
///
/// Starts at 1 and is never reused for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(u32);

impl PeerId {
    /// The first identity a server hands out
    pub const FIRST: PeerId = PeerId(1);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Graceful teardown announcement, sent by either side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMessage {
    pub text: String,
}

impl DisconnectMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Roster snapshot broadcast by the server after a join or leave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// The peer that joined or left
    pub peer_id: PeerId,
    /// True if the peer has just connected, false if it has just left
    pub connecting: bool,
    /// Every peer registered at the time of the change
    pub peers: BTreeSet<PeerId>,
}

/// An inbound payload re-broadcast by the server's default dispatch
#[derive(Debug)]
pub struct ForwardedMessage<T> {
    pub sender_id: PeerId,
    pub payload: Arc<T>,
}

impl<T> Clone for ForwardedMessage<T> {
    fn clone(&self) -> Self {
        Self {
            sender_id: self.sender_id,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// All values that travel over a connection
#[derive(Debug)]
pub enum Message<T> {
    /// Handshake greeting from the client
    Hello(String),

    /// Handshake reply carrying the assigned peer id
    Welcome(PeerId),

    /// Written once in answer to a `Disconnect`
    Acknowledge(String),

    /// Clears payload memoisation on both ends of the stream
    Reset,

    /// Graceful disconnect
    Disconnect(DisconnectMessage),

    /// Roster change
    Status(StatusMessage),

    /// Opaque application payload
    Application(Arc<T>),

    /// Application payload tagged with the peer that sent it to the server
    Forwarded(ForwardedMessage<T>),
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        match self {
            Message::Hello(text) => Message::Hello(text.clone()),
            Message::Welcome(id) => Message::Welcome(*id),
            Message::Acknowledge(text) => Message::Acknowledge(text.clone()),
            Message::Reset => Message::Reset,
            Message::Disconnect(msg) => Message::Disconnect(msg.clone()),
            Message::Status(status) => Message::Status(status.clone()),
            Message::Application(payload) => Message::Application(Arc::clone(payload)),
            Message::Forwarded(forwarded) => Message::Forwarded(forwarded.clone()),
        }
    }
}

impl<T> Message<T> {
    /// Get the message type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Hello(_) => 0x01,
            Message::Welcome(_) => 0x02,
            Message::Acknowledge(_) => 0x03,
            Message::Reset => 0x10,
            Message::Disconnect(_) => 0x11,
            Message::Status(_) => 0x12,
            Message::Application(_) => 0x20,
            Message::Forwarded(_) => 0x21,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::Welcome(_) => "Welcome",
            Message::Acknowledge(_) => "Acknowledge",
            Message::Reset => "Reset",
            Message::Disconnect(_) => "Disconnect",
            Message::Status(_) => "Status",
            Message::Application(_) => "Application",
            Message::Forwarded(_) => "Forwarded",
        }
    }

    /// Messages after which the sender loop stops writing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::Disconnect(_) | Message::Acknowledge(_))
    }

    /// Messages whose body goes through payload memoisation
    pub fn carries_payload(&self) -> bool {
        matches!(self, Message::Application(_) | Message::Forwarded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_ordering() {
        assert!(PeerId::FIRST < PeerId::FIRST.next());
        assert_eq!(PeerId::FIRST.next().get(), 2);
        assert_eq!(PeerId::new(7).to_string(), "7");
    }

    #[test]
    fn test_message_type_ids_are_distinct() {
        let messages: Vec<Message<String>> = vec![
            Message::Hello("hi".into()),
            Message::Welcome(PeerId::FIRST),
            Message::Acknowledge("ack".into()),
            Message::Reset,
            Message::Disconnect(DisconnectMessage::new("bye")),
            Message::Status(StatusMessage {
                peer_id: PeerId::FIRST,
                connecting: true,
                peers: BTreeSet::new(),
            }),
            Message::Application(Arc::new("x".to_string())),
            Message::Forwarded(ForwardedMessage {
                sender_id: PeerId::FIRST,
                payload: Arc::new("y".to_string()),
            }),
        ];
        let ids: BTreeSet<u8> = messages.iter().map(Message::type_id).collect();
        assert_eq!(ids.len(), messages.len());
    }

    #[test]
    fn test_terminal_messages() {
        assert!(Message::<String>::Disconnect(DisconnectMessage::new("bye")).is_terminal());
        assert!(Message::<String>::Acknowledge("ack".into()).is_terminal());
        assert!(!Message::Application(Arc::new(1u8)).is_terminal());
        assert!(!Message::<u8>::Reset.carries_payload());
    }

    #[test]
    fn test_clone_shares_payload() {
        let msg = Message::Application(Arc::new(vec![1u8, 2, 3]));
        let copy = msg.clone();
        match (msg, copy) {
            (Message::Application(a), Message::Application(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("Wrong message type"),
        }
    }
}
