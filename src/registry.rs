//! Session registry
//!
//! In-memory table of every session the manager knows about. It is the
//! single source of truth for what is currently running. Locks are held only
//! for the duration of a single mutation and never across an await point.

use crate::session::{Session, SessionId, SessionKind, SessionStatus};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    active_id: Option<SessionId>,
}

/// A session taken out of the registry
#[derive(Debug, Clone)]
pub struct Removed {
    pub session: Session,
    /// The session held UI focus, which is now cleared
    pub was_active: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new session. Returns false (and leaves the existing entry
    /// untouched) when the id is already registered.
    pub fn register(&self, session: Session) -> bool {
        let mut state = self.write();
        if state.sessions.contains_key(&session.id) {
            warn!(session_id = %session.id, "Refusing to register duplicate session id");
            return false;
        }
        debug!(session_id = %session.id, kind = ?session.kind(), "Registered session");
        state.sessions.insert(session.id.clone(), session);
        true
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.read().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.read().sessions.contains_key(id)
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionStatus> {
        self.read().sessions.get(id).map(|session| session.status)
    }

    /// Apply `mutator` to a session. Absent ids are a no-op returning `None`,
    /// so removed entries are never resurrected.
    pub fn update<R>(&self, id: &SessionId, mutator: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut state = self.write();
        state.sessions.get_mut(id).map(mutator)
    }

    /// Delete an entry. Callers release any subscription for the id first.
    pub fn remove(&self, id: &SessionId) -> Option<Removed> {
        let mut state = self.write();
        let session = state.sessions.remove(id)?;
        let was_active = state.active_id.as_ref() == Some(id);
        if was_active {
            state.active_id = None;
        }
        debug!(session_id = %id, was_active, "Removed session");
        Some(Removed {
            session,
            was_active,
        })
    }

    pub fn list(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn list_by_status(&self, status: SessionStatus) -> Vec<Session> {
        self.filter(|session| session.status == status)
    }

    pub fn list_by_kind(&self, kind: SessionKind) -> Vec<Session> {
        self.filter(|session| session.kind() == kind)
    }

    pub fn filter(&self, predicate: impl Fn(&Session) -> bool) -> Vec<Session> {
        self.read()
            .sessions
            .values()
            .filter(|session| predicate(session))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.read().active_id.clone()
    }

    /// Point UI focus at a session. Unknown ids are ignored; returns whether
    /// the pointer changed.
    pub fn set_active(&self, id: Option<&SessionId>) -> bool {
        let mut state = self.write();
        if let Some(id) = id {
            if !state.sessions.contains_key(id) {
                return false;
            }
        }
        let next = id.cloned();
        if state.active_id == next {
            return false;
        }
        state.active_id = next;
        true
    }
}
