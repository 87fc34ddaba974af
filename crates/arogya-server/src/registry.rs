//! Live connection registry.
//!
//! Tracks every authenticated transport connection, the principal that owns
//! it, and which conversations it has joined. A principal may hold several
//! connections at once (multiple devices or tabs).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arogya_shared::protocol::ServerEvent;
use arogya_shared::{ConnectionId, ConversationId, PrincipalId};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Events a connection may have queued before it is treated as lagging.
pub const OUTBOUND_QUEUE: usize = 256;

/// Sender half of a connection's outbound queue.
pub type ConnectionSender = mpsc::Sender<ServerEvent>;

struct ConnectionEntry {
    principal: PrincipalId,
    sender: ConnectionSender,
    joined: HashSet<ConversationId>,
    evicted: Arc<Notify>,
}

/// Result of queueing an event on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// The queue is full; the connection has been evicted.
    Lagging,
    /// The connection already went away.
    Closed,
}

/// A resolved live connection, ready to push to.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub principal: PrincipalId,
    sender: ConnectionSender,
}

impl ConnectionHandle {
    /// Queue an event without waiting. A full queue evicts the connection
    /// from `registry` so one slow reader cannot stall delivery to others.
    pub fn push(&self, registry: &ConnectionRegistry, event: ServerEvent) -> Push {
        match self.sender.try_send(event) {
            Ok(()) => Push::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(
                    principal = %self.principal,
                    connection = %self.id,
                    "Outbound queue full, evicting"
                );
                registry.evict(self.id);
                Push::Lagging
            }
            Err(TrySendError::Closed(_)) => Push::Closed,
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    by_principal: Arc<DashMap<PrincipalId, HashSet<ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, principal: &PrincipalId, sender: ConnectionSender) -> ConnectionId {
        let id = ConnectionId::new();

        self.connections.insert(
            id,
            ConnectionEntry {
                principal: principal.clone(),
                sender,
                joined: HashSet::new(),
                evicted: Arc::new(Notify::new()),
            },
        );
        let devices = {
            let mut ids = self.by_principal.entry(principal.clone()).or_default();
            ids.insert(id);
            ids.len()
        };

        debug!(principal = %principal, connection = %id, devices, "Connection registered");
        id
    }

    /// Remove a connection and all of its room bindings. Idempotent.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return false;
        };

        if let Some(mut ids) = self.by_principal.get_mut(&entry.principal) {
            ids.remove(&id);
        }
        self.by_principal
            .remove_if(&entry.principal, |_, ids| ids.is_empty());

        debug!(
            principal = %entry.principal,
            connection = %id,
            rooms = entry.joined.len(),
            "Connection unregistered"
        );
        true
    }

    /// Unregister a connection and wake whoever waits on its eviction
    /// signal. Used when a connection falls too far behind.
    pub fn evict(&self, id: ConnectionId) -> bool {
        let signal = self.connections.get(&id).map(|e| e.evicted.clone());
        let removed = self.unregister(id);
        if let Some(signal) = signal {
            signal.notify_one();
        }
        removed
    }

    /// Fires once `id` has been evicted. `None` if it is not registered.
    pub fn eviction_signal(&self, id: ConnectionId) -> Option<Arc<Notify>> {
        self.connections.get(&id).map(|e| e.evicted.clone())
    }

    /// Mark a connection as live for a conversation and return a handle to
    /// it, or `None` if the connection is gone.
    pub fn bind(&self, id: ConnectionId, conversation: ConversationId) -> Option<ConnectionHandle> {
        let mut entry = self.connections.get_mut(&id)?;
        entry.joined.insert(conversation);
        Some(ConnectionHandle {
            id,
            principal: entry.principal.clone(),
            sender: entry.sender.clone(),
        })
    }

    pub fn connections_for(&self, principal: &PrincipalId) -> Vec<ConnectionHandle> {
        self.resolve(principal, None)
    }

    /// Connections of `principal` that have joined `conversation`.
    pub fn joined_connections_for(
        &self,
        principal: &PrincipalId,
        conversation: ConversationId,
    ) -> Vec<ConnectionHandle> {
        self.resolve(principal, Some(conversation))
    }

    fn resolve(
        &self,
        principal: &PrincipalId,
        conversation: Option<ConversationId>,
    ) -> Vec<ConnectionHandle> {
        // Copy the id set out so no by_principal shard is held while
        // touching the connections map.
        let ids: Vec<ConnectionId> = match self.by_principal.get(principal) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };

        ids.into_iter()
            .filter_map(|id| {
                let entry = self.connections.get(&id)?;
                if let Some(conversation) = conversation {
                    if !entry.joined.contains(&conversation) {
                        return None;
                    }
                }
                Some(ConnectionHandle {
                    id,
                    principal: entry.principal.clone(),
                    sender: entry.sender.clone(),
                })
            })
            .collect()
    }

    pub fn is_online(&self, principal: &PrincipalId) -> bool {
        self.by_principal.contains_key(principal)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Online principals and their device counts.
    pub fn snapshot(&self) -> HashMap<PrincipalId, usize> {
        self.by_principal
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }
}
