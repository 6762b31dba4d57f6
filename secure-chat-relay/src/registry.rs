//! The relay's view of who is connected.
//!
//! Every read or write of the session map goes through [`SessionRegistry`],
//! which holds one mutex for the whole map. Operations never perform network
//! I/O while the lock is held: callers clone a [`Session`] out and talk to the
//! socket afterwards.

use std::{
    collections::BTreeMap,
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{cipher::PublicKey, error::SessionError, frame::write_frame};

pub type ConnectionId = u64;

/// Per-socket data. `user_id` and `public_key` do not change after the
/// handshake, `connected` does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub user_id: String,
    pub public_key: Option<PublicKey>,
    pub connected: bool,
}

impl ConnectionState {
    pub fn placeholder(id: ConnectionId) -> Self {
        Self {
            id,
            user_id: String::new(),
            public_key: None,
            connected: false,
        }
    }

    /// Name used in log lines, falling back to the id before the handshake.
    pub fn display_name(&self) -> String {
        if self.user_id.is_empty() {
            format!("connection {}", self.id)
        } else {
            self.user_id.clone()
        }
    }
}

type FrameSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared send half of a connection.
///
/// Writers from different workers take turns on the inner mutex, so frames to
/// one recipient are never interleaved.
#[derive(Clone)]
pub struct Outbound {
    sink: Arc<Mutex<FrameSink>>,
}

impl Outbound {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn send(&self, frame: &str) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        write_frame(&mut *sink, frame).await
    }

    /// Shuts the send direction down. The peer sees end-of-stream.
    pub async fn close(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.shutdown().await
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound").finish_non_exhaustive()
    }
}

/// A registry entry: connection data plus a way to reach the peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: ConnectionState,
    pub outbound: Outbound,
}

impl Session {
    pub fn placeholder(id: ConnectionId, outbound: Outbound) -> Self {
        Self {
            state: ConnectionState::placeholder(id),
            outbound,
        }
    }
}

/// Thread-safe map from connection id to [`Session`].
///
/// A `BTreeMap` keeps scans in ascending id order, so when a lookup by user id
/// could match more than one entry the oldest connection wins.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<ConnectionId, Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id that is never handed out again in this process.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns `false` and keeps the existing entry if the id is taken.
    pub async fn insert(&self, session: Session) -> bool {
        let mut sessions = self.sessions.lock().await;
        let id = session.state.id;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, session);
        true
    }

    pub async fn update<F, R>(&self, id: ConnectionId, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut ConnectionState) -> R,
    {
        let mut sessions = self.sessions.lock().await;
        sessions.get_mut(&id).map(|session| mutate(&mut session.state))
    }

    /// Records the identity presented during the handshake.
    ///
    /// The duplicate check and the store happen under the same lock, so two
    /// handshakes can never both claim one user id.
    pub async fn claim_identity(
        &self,
        id: ConnectionId,
        user_id: &str,
        public_key: PublicKey,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;

        if sessions
            .values()
            .any(|session| session.state.connected && session.state.user_id == user_id)
        {
            return Err(SessionError::DuplicateUser(user_id.to_string()));
        }

        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| SessionError::NotFound(format!("connection {id}")))?;
        session.state.user_id = user_id.to_string();
        session.state.public_key = Some(public_key);
        Ok(())
    }

    /// Flags the entry as live. Refuses entries that never finished a
    /// handshake, so a connected entry always carries a key.
    pub async fn mark_connected(&self, id: ConnectionId) -> bool {
        self.update(id, |state| {
            if state.public_key.is_none() {
                return false;
            }
            state.connected = true;
            true
        })
        .await
        .unwrap_or(false)
    }

    /// First connected session with this user id.
    pub async fn find(&self, user_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .find(|session| session.state.connected && session.state.user_id == user_id)
            .cloned()
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).cloned()
    }

    /// Removing an id that is not present is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id)
    }

    /// States of all connected sessions.
    pub async fn snapshot(&self) -> Vec<ConnectionState> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|session| session.state.connected)
            .map(|session| session.state.clone())
            .collect()
    }

    /// Every registered id, connected or not.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        let sessions = self.sessions.lock().await;
        sessions.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: PublicKey = PublicKey { e: 7, n: 299 };

    async fn connected(registry: &SessionRegistry, user: &str) -> ConnectionId {
        let id = registry.next_id();
        assert!(
            registry
                .insert(Session::placeholder(id, Outbound::new(tokio::io::sink())))
                .await
        );
        registry
            .claim_identity(id, user, KEY)
            .await
            .expect("claim should pass");
        assert!(registry.mark_connected(id).await);
        id
    }

    #[tokio::test]
    async fn rejects_duplicate_connected_user() {
        let registry = SessionRegistry::new();
        connected(&registry, "alice").await;

        let id = registry.next_id();
        registry
            .insert(Session::placeholder(id, Outbound::new(tokio::io::sink())))
            .await;
        let result = registry.claim_identity(id, "alice", KEY).await;

        assert!(matches!(result, Err(SessionError::DuplicateUser(user)) if user == "alice"));
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn user_id_is_reusable_after_disconnect() {
        let registry = SessionRegistry::new();
        let first = connected(&registry, "alice").await;
        registry.remove(first).await;

        let second = connected(&registry, "alice").await;
        let found = registry.find("alice").await.expect("alice is back");
        assert_eq!(found.state.id, second);
    }

    #[tokio::test]
    async fn find_ignores_entries_that_are_not_connected() {
        let registry = SessionRegistry::new();
        let id = registry.next_id();
        registry
            .insert(Session::placeholder(id, Outbound::new(tokio::io::sink())))
            .await;
        registry
            .claim_identity(id, "bob", KEY)
            .await
            .expect("claim should pass");

        assert!(registry.find("bob").await.is_none());
        assert!(registry.mark_connected(id).await);
        assert!(registry.find("bob").await.is_some());
    }

    #[tokio::test]
    async fn placeholder_without_key_cannot_be_marked_connected() {
        let registry = SessionRegistry::new();
        let id = registry.next_id();
        registry
            .insert(Session::placeholder(id, Outbound::new(tokio::io::sink())))
            .await;

        assert!(!registry.mark_connected(id).await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn insert_keeps_the_first_entry_for_an_id() {
        let registry = SessionRegistry::new();
        let id = connected(&registry, "alice").await;

        let inserted = registry
            .insert(Session::placeholder(id, Outbound::new(tokio::io::sink())))
            .await;

        assert!(!inserted);
        assert_eq!(registry.len().await, 1);
        assert!(registry.find("alice").await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = connected(&registry, "carol").await;

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let registry = SessionRegistry::new();
        let first = registry.next_id();
        let second = registry.next_id();
        assert_ne!(first, second);
    }
}
