//! Unified error type for the Keyrace server.

use keyrace_protocol::ProtocolError;
use keyrace_room::RoomError;
use keyrace_session::SessionError;
use keyrace_stats::VerifyError;
use keyrace_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Handlers return this; the dispatcher turns it into an `ERROR` reply
/// for the connection that sent the request. The `Display` text is what
/// that client sees.
#[derive(Debug, thiserror::Error)]
pub enum KeyraceError {
    /// A transport-level error (bind, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (auth, unknown connection, not in a room).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A room-level error (invalid transition, not host, ...).
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A submitted result failed its integrity checks.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The result store refused or failed to save.
    #[error("result store error: {0}")]
    Store(String),

    /// Request rejected before it reached a room.
    #[error("{0}")]
    BadRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrace_protocol::RoomId;
    use keyrace_transport::ConnectionId;

    #[test]
    fn test_from_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no upgrade");
        let keyrace_err: KeyraceError = TransportError::HandshakeFailed(io).into();
        assert!(matches!(keyrace_err, KeyraceError::Transport(_)));
        assert!(keyrace_err.to_string().contains("no upgrade"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let keyrace_err: KeyraceError = ProtocolError::Decode(err).into();
        assert!(matches!(keyrace_err, KeyraceError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::NotInRoom(ConnectionId::new(3));
        let keyrace_err: KeyraceError = err.into();
        assert!(matches!(keyrace_err, KeyraceError::Session(_)));
    }

    #[test]
    fn test_from_room_error_keeps_client_message() {
        let err = RoomError::NotFound(RoomId("ABC123".into()));
        let keyrace_err: KeyraceError = err.into();
        assert!(matches!(keyrace_err, KeyraceError::Room(_)));
        assert_eq!(keyrace_err.to_string(), "Room ABC123 not found");
    }

    #[test]
    fn test_from_verify_error() {
        let keyrace_err: KeyraceError = VerifyError::HashMismatch.into();
        assert_eq!(keyrace_err.to_string(), "result hash mismatch");
    }
}
