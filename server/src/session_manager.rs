//! Registry of live sessions for the dispatch loop
//!
//! This module tracks every connected session and which username each
//! logged-in session holds. It handles:
//! - Session id allocation for newly accepted connections
//! - Username binding on login and release on removal
//! - Iteration for broadcasts and keepalive sweeps
//!
//! The manager is owned by the dispatch loop and never shared, so lookups
//! and mutations need no locking.

use log::info;
use std::collections::{BTreeMap, HashMap};

use crate::session::{SessionHandle, SessionId};

/// Manages all registered sessions
///
/// Sessions are kept in id order, which is also the order they were
/// accepted in. Usernames are unique across the sessions that hold one.
#[derive(Debug)]
pub struct SessionManager {
    /// Registered sessions indexed by id
    sessions: BTreeMap<SessionId, SessionHandle>,
    /// Username to session id, for logged-in sessions only
    usernames: HashMap<String, SessionId>,
    /// Next id handed to an accepted connection
    next_id: SessionId,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Creates an empty manager. Ids start at 1.
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            usernames: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserves the id for the next session to be registered
    pub fn allocate_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers a started session
    pub fn insert(&mut self, session: SessionHandle) {
        info!("Session {} registered from {}", session.id(), session.addr());
        self.sessions.insert(session.id(), session);
    }

    /// Removes a session and releases its username
    ///
    /// Returns the handle so the caller can finish closing it.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionHandle> {
        let session = self.sessions.remove(&id)?;
        if let Some(name) = &session.username {
            self.usernames.remove(name);
        }
        info!("Session {} removed", id);
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionHandle> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(&id)
    }

    /// Finds the session currently logged in as `username`
    pub fn find_by_username(&self, username: &str) -> Option<SessionId> {
        self.usernames.get(username).copied()
    }

    /// Marks a session as logged in under `username`
    ///
    /// Returns false if the session is unknown, already has a name, or the
    /// name is taken by another session.
    pub fn bind_username(&mut self, id: SessionId, username: &str) -> bool {
        if self.usernames.contains_key(username) {
            return false;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.username.is_some() {
            return false;
        }

        session.username = Some(username.to_string());
        self.usernames.insert(username.to_string(), id);
        true
    }

    /// All registered ids, in accept order
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionHandle> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionHandle> {
        self.sessions.values_mut()
    }

    /// Returns the number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
