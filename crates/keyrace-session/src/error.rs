//! Error types for the session layer.

use keyrace_transport::ConnectionId;

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The credential was invalid, expired, or rejected by the
    /// [`Authenticator`](crate::Authenticator).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No session is registered for the connection.
    #[error("no session for connection {0}")]
    NotFound(ConnectionId),

    /// The connection hasn't joined a room yet.
    #[error("connection {0} is not in a room")]
    NotInRoom(ConnectionId),
}
