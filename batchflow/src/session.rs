//! Cross-client execution lock
//!
//! The server is the only authority on who owns the session. The arbiter
//! mirrors whatever the server last pushed and answers whether this client
//! may act; it requests `start_session` / `end_session` but never assumes the
//! outcome.

use shared_types::{ClientCommand, ServerMessage, SessionStatus};

use crate::connection::{ConnectionError, ConnectionManager};

#[derive(Debug, Clone, Default)]
pub struct SessionArbiter {
    identity: Option<String>,
    status: SessionStatus,
}

impl SessionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection id assigned by the server in `welcome`.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Fold an inbound message into the mirrored state.
    ///
    /// Returns `true` when the message carried session information.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Welcome {
                connection_id,
                session_active,
                session_owner,
                ..
            } => {
                if connection_id.is_some() {
                    self.identity = connection_id.clone();
                }
                self.status = SessionStatus {
                    active: *session_active,
                    owner: session_owner.clone(),
                };
            }
            ServerMessage::SessionStarted(update)
            | ServerMessage::SessionEnded(update)
            | ServerMessage::SessionStatus(update) => {
                self.status = update.status();
            }
            _ => return false,
        }
        tracing::debug!(
            active = self.status.active,
            owner = ?self.status.owner,
            me = ?self.identity,
            "session state updated"
        );
        true
    }

    pub fn can_act(&self) -> bool {
        self.status.permits(self.identity.as_deref())
    }

    /// Whether the lock is held by this client.
    pub fn owns_session(&self) -> bool {
        self.status.active && self.can_act()
    }

    pub fn request_start(&self, connection: &ConnectionManager) -> Result<(), ConnectionError> {
        connection.send(&ClientCommand::StartSession)
    }

    pub fn request_end(&self, connection: &ConnectionManager) -> Result<(), ConnectionError> {
        connection.send(&ClientCommand::EndSession)
    }
}
