use chrono::{DateTime, Utc};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::auth::Identity;

/// Lifecycle of one connection.
///
/// `Connecting` covers the HTTP upgrade (the token has been verified but the
/// socket is not open yet). `Authenticated` means the socket is open and
/// bound to a user; `Active` means the session is in the registry and
/// frames are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Server-side state of one live connection. Owned by its worker; the
/// registry only keeps a routing handle keyed by `id`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    user_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: identity.user_id,
            email: identity.email,
            created_at: Utc::now(),
            state: SessionState::Connecting,
        }
    }

    /// Fixed for the lifetime of the session.
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if the transition is legal. Returns false (and leaves
    /// the state alone) otherwise.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition(next) {
            warn!(
                "Session {} refused transition {:?} -> {:?}",
                self.id, self.state, next
            );
            return false;
        }
        trace!("Session {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        true
    }
}
