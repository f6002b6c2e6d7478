//! Server-side bookkeeping of open connections

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

use super::connection::ConnectionHandle;
use crate::protocol::{Message, PeerId, StatusMessage};

struct Inner<T> {
    peers: BTreeMap<PeerId, ConnectionHandle<T>>,
    next_id: PeerId,
    /// Set by `drain`. A closed registry accepts no further registrations.
    closed: bool,
}

/// Maps peer ids to open connections.
///
/// Registration and removal happen under one lock together with the roster
/// broadcast, so every status message reflects a single consistent change.
pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: BTreeMap::new(),
                next_id: PeerId::FIRST,
                closed: false,
            }),
        }
    }

    /// Hand out the next peer id. Ids are never reused.
    pub async fn allocate_id(&self) -> PeerId {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id = id.next();
        id
    }

    /// Open the connection, add it and tell every peer, the new one included.
    ///
    /// Returns None, leaving the connection untouched, once the registry has
    /// been drained.
    pub async fn register(&self, handle: ConnectionHandle<T>) -> Option<StatusMessage> {
        let mut inner = self.inner.lock().await;
        let peer_id = handle.peer_id();
        if inner.closed {
            tracing::debug!("Registry closed, not registering peer {}", peer_id);
            return None;
        }
        handle.mark_open();
        inner.peers.insert(peer_id, handle);

        let status = StatusMessage {
            peer_id,
            connecting: true,
            peers: inner.peers.keys().copied().collect(),
        };
        Self::broadcast_locked(&inner, Message::Status(status.clone()));
        tracing::info!("Peer {} registered, {} connected", peer_id, inner.peers.len());
        Some(status)
    }

    /// Remove a peer and tell the rest. Returns None if it was not registered.
    pub async fn deregister(&self, peer_id: PeerId) -> Option<StatusMessage> {
        let mut inner = self.inner.lock().await;
        inner.peers.remove(&peer_id)?;

        let status = StatusMessage {
            peer_id,
            connecting: false,
            peers: inner.peers.keys().copied().collect(),
        };
        Self::broadcast_locked(&inner, Message::Status(status.clone()));
        tracing::info!("Peer {} deregistered, {} connected", peer_id, inner.peers.len());
        Some(status)
    }

    /// Run `f` while holding the lock, but only if `peer_id` is registered.
    ///
    /// Anything `f` does is ordered before a concurrent `deregister` of the
    /// same peer completes.
    pub async fn with_peer<R>(&self, peer_id: PeerId, f: impl FnOnce() -> R) -> Option<R> {
        let inner = self.inner.lock().await;
        if inner.peers.contains_key(&peer_id) {
            Some(f())
        } else {
            None
        }
    }

    pub async fn peer_ids(&self) -> BTreeSet<PeerId> {
        self.inner.lock().await.peers.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.peers.is_empty()
    }

    /// Queue a message on every registered connection. Returns how many accepted it.
    pub async fn broadcast(&self, message: Message<T>) -> usize {
        let inner = self.inner.lock().await;
        Self::broadcast_locked(&inner, message)
    }

    /// Queue a message for one peer. False if the id is unknown or its
    /// connection is no longer open.
    pub async fn send_to(&self, peer_id: PeerId, message: Message<T>) -> bool {
        let inner = self.inner.lock().await;
        match inner.peers.get(&peer_id) {
            Some(handle) => match handle.enqueue(message) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Could not queue message for peer {}: {}", peer_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Remove every connection at once, without any status broadcast, and
    /// close the registry to new ones
    pub async fn drain(&self) -> Vec<ConnectionHandle<T>> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        std::mem::take(&mut inner.peers).into_values().collect()
    }

    fn broadcast_locked(inner: &Inner<T>, message: Message<T>) -> usize {
        let mut delivered = 0;
        for (peer_id, handle) in &inner.peers {
            match handle.enqueue(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!("Skipping peer {} in broadcast: {}", peer_id, e);
                }
            }
        }
        delivered
    }
}
