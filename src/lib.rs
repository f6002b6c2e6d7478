//! CardNet - Client/server message transport for small multiplayer card games
//!
//! A server accepts players over TCP, assigns each a peer id, keeps every
//! player informed of the roster and funnels inbound payloads through one
//! ordered dispatch task. Payloads are any serde type.

pub mod config;
pub mod logging;
pub mod network;
pub mod protocol;

pub use config::{ClientConfig, Config, GeneralConfig, ServerConfig};
pub use network::{
    Client, ClientError, ClientHandler, ForwardingHandler, Incoming, Server, ServerError,
    ServerHandler,
};
pub use protocol::{ForwardedMessage, PeerId, StatusMessage, DEFAULT_PORT};
