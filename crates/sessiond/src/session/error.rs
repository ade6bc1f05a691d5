//! Errors surfaced by the session registry.

use thiserror::Error;

use super::handle::ConnectionId;

/// Opaque identifier of a session.
pub type SessionKey = String;

/// Errors that can occur during session registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session is registered under the key, or it has been evicted.
    #[error("Session {0} not found")]
    NotFound(SessionKey),

    /// A session is already registered under the key.
    #[error("Session {0} already registered")]
    AlreadyRegistered(SessionKey),

    /// A connection with the same identity is already a member.
    #[error("connection {id} already joined session {key}")]
    DuplicateMember {
        /// The session key.
        key: SessionKey,
        /// The conflicting connection identity.
        id: ConnectionId,
    },
}
