//! Registry of connected sessions
//!
//! This module keeps the server-side table of every live session, including:
//! - Session lookup by id for the tick loop's per-tick emission
//! - Role filtered snapshots (bots, observers, operators)
//! - Session counts for diagnostics
//!
//! The table is a plain mutex-guarded map. Entries are inserted when a
//! connection completes its handshake and removed exactly once by the
//! session's own termination path.

use crate::session::Session;
use log::debug;
use shared::{Role, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Manages all connected sessions
///
/// The ClientManager is shared between every session task and the tick loop.
/// Callers take short snapshots of the table instead of holding the lock
/// while they do I/O or encode frames.
#[derive(Default)]
pub struct ClientManager {
    /// Connected sessions indexed by their unique id
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl ClientManager {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a session to the registry
    ///
    /// Session ids come from the id allocator and are never reused, so an
    /// insert never replaces a live entry.
    pub fn insert(&self, session: Arc<Session>) {
        debug!(
            "Session {} ({:?}) registered from {}",
            session.id, session.role, session.peer
        );
        self.lock().insert(session.id, session);
    }

    /// Removes a session from the registry
    ///
    /// Returns the removed session, or None if it was already gone.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    /// Snapshot of every session with the given role, in id order
    pub fn with_role(&self, role: Role) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .lock()
            .values()
            .filter(|s| s.role == role)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Snapshot of every session
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of sessions per role as (bots, observers, operators)
    pub fn counts(&self) -> (usize, usize, usize) {
        let sessions = self.lock();
        let count = |role| sessions.values().filter(|s| s.role == role).count();
        (
            count(Role::Bot),
            count(Role::Observer),
            count(Role::Operator),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn session(id: SessionId, role: Role) -> Arc<Session> {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Arc::new(Session::new(id, role, peer, 8))
    }

    #[test]
    fn test_insert_get_remove() {
        let clients = ClientManager::new();
        clients.insert(session(1, Role::Bot));
        clients.insert(session(2, Role::Observer));

        assert_eq!(clients.len(), 2);
        assert_eq!(clients.get(1).map(|s| s.role), Some(Role::Bot));
        assert!(clients.remove(1).is_some());
        assert!(clients.remove(1).is_none());
        assert!(clients.get(1).is_none());
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn test_role_snapshots() {
        let clients = ClientManager::new();
        clients.insert(session(3, Role::Bot));
        clients.insert(session(1, Role::Bot));
        clients.insert(session(2, Role::Operator));

        let bots: Vec<SessionId> = clients.with_role(Role::Bot).iter().map(|s| s.id).collect();
        assert_eq!(bots, vec![1, 3]);
        assert_eq!(clients.counts(), (2, 0, 1));
        assert_eq!(clients.all().len(), 3);
    }
}
