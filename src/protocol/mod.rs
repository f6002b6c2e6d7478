//! Protocol module - Defines the wire protocol for CardNet communication
//!
//! The protocol uses a simple binary format:
//! - 4 bytes magic
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length bincode payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default port for CardNet servers
pub const DEFAULT_PORT: u16 = 32058;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x43, 0x4E, 0x45, 0x54]; // "CNET"

/// First frame a client writes on a fresh connection
pub const HELLO_TOKEN: &str = "Hello Server";

/// Written back by whichever side receives a `DisconnectMessage`
pub const ACKNOWLEDGMENT: &str = "* Good Bye *";

/// Text carried by a client-initiated disconnect
pub const CLIENT_FAREWELL: &str = "Good Bye";

/// Text carried by the disconnect sent to every peer on server shutdown
pub const SERVER_SHUTDOWN: &str = "*Server shutdown*";
