//! Network module - Handles TCP communication between a server and its peers
//!
//! Provides:
//! - Connection endpoints with one sender and one receiver task each
//! - The server's peer registry and roster broadcast
//! - Server runtime for accepting peers and dispatching their messages
//! - Client runtime for connecting to a server

mod client;
mod connection;
mod registry;
mod server;

pub use client::*;
pub use connection::*;
pub use registry::*;
pub use server::*;

use std::net::SocketAddr;
use tokio::sync::watch;

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Resolves once the flag is raised or its sender is dropped.
pub(crate) async fn raised(mut flag: watch::Receiver<bool>) {
    loop {
        let up = *flag.borrow_and_update();
        if up || flag.changed().await.is_err() {
            return;
        }
    }
}
