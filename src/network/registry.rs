//! Session Registry
//!
//! Concurrency-safe map from player id to the outbound handle of a live
//! connection. The registry owns the only long-lived sender into each
//! session's writer; dropping an entry closes that writer, and evicting one
//! also stops the session's reader.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::game::state::PlayerId;
use crate::network::protocol::ServerMessage;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Server already holds the maximum number of sessions.
    #[error("Session capacity exceeded (max {max})")]
    CapacityExceeded {
        /// Configured limit.
        max: usize,
    },
}

/// Outbound handle for one connected player.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Queue into the session's writer task.
    pub sender: mpsc::Sender<ServerMessage>,
    /// Signalled when the server drops the session.
    pub evicted: Arc<Notify>,
}

impl SessionHandle {
    /// Writer task still running.
    pub fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Live sessions keyed by player id.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<PlayerId, SessionHandle>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create an empty registry admitting at most `max_sessions`.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    /// Admit a connection and assign it a fresh player id.
    ///
    /// Ids are never reused; a rejected registration consumes none.
    /// `evicted` is notified if the server later drops the session.
    pub async fn register(
        &self,
        addr: SocketAddr,
        sender: mpsc::Sender<ServerMessage>,
        evicted: Arc<Notify>,
    ) -> Result<PlayerId, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_sessions,
            });
        }

        let player_id = PlayerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        sessions.insert(
            player_id,
            SessionHandle {
                player_id,
                addr,
                sender,
                evicted,
            },
        );

        Ok(player_id)
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn unregister(&self, player_id: PlayerId) -> bool {
        self.sessions.write().await.remove(&player_id).is_some()
    }

    /// Remove a session and tell its tasks to shut down.
    pub async fn evict(&self, player_id: PlayerId) -> bool {
        match self.sessions.write().await.remove(&player_id) {
            Some(handle) => {
                // Stores a permit if the session is not waiting yet
                handle.evicted.notify_one();
                true
            }
            None => false,
        }
    }

    /// Handle for one player.
    pub async fn lookup(&self, player_id: PlayerId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&player_id).cloned()
    }

    /// All live sessions, ordered by player id.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|handle| handle.is_live())
            .cloned()
            .collect()
    }

    /// Registered session count.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// No sessions registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Configured session limit.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
