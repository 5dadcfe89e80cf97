use dashmap::{mapref::entry::Entry, DashMap};

use crate::error::RegistryError;
use crate::signaling::{SessionId, UserId};

/// Per-connection identity and call state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    /// Other party of a pending or active call.
    pub peer: Option<UserId>,
    /// Offer stored by `call`, consumed when the callee accepts.
    pub pending_offer: Option<String>,
}

/// Bidirectional index between session ids and user ids.
#[derive(Default)]
pub struct SessionRegistry {
    by_session: DashMap<SessionId, Session>,
    by_user: DashMap<UserId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        session_id: &str,
        user_id: &str,
        display_name: &str,
        avatar: Option<String>,
    ) -> Result<Session, RegistryError> {
        if display_name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        // Claiming the user entry makes the duplicate check and insert atomic.
        match self.by_user.entry(user_id.to_string()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateUser(user_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_string());
            }
        }

        let session = Session {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            avatar,
            peer: None,
            pending_offer: None,
        };
        if let Some(previous) = self
            .by_session
            .insert(session_id.to_string(), session.clone())
        {
            self.by_user
                .remove_if(&previous.user_id, |_, owner| owner == session_id);
        }
        Ok(session)
    }

    /// Drop both indices for a session. Unknown ids are ignored.
    pub fn unregister(&self, session_id: &str) -> Option<Session> {
        let (_, session) = self.by_session.remove(session_id)?;
        self.by_user
            .remove_if(&session.user_id, |_, owner| owner == session_id);
        Some(session)
    }

    pub fn lookup_by_session(&self, session_id: &str) -> Option<Session> {
        self.by_session.get(session_id).map(|entry| entry.clone())
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Option<Session> {
        let session_id = self.by_user.get(user_id)?.clone();
        self.lookup_by_session(&session_id)
    }

    /// Apply `f` to the stored session. Returns false when the session is gone.
    pub fn update(&self, session_id: &str, f: impl FnOnce(&mut Session)) -> bool {
        match self.by_session.get_mut(session_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Clear the peer pointer, returning what it held.
    pub fn take_peer(&self, session_id: &str) -> Option<UserId> {
        self.by_session
            .get_mut(session_id)
            .and_then(|mut entry| entry.peer.take())
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
