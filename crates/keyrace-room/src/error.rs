//! Error types for the room layer.
//!
//! Every variant is a domain error: recoverable, and reported only to the
//! connection whose request caused it. The `Display` text is what that
//! client sees.

use keyrace_protocol::{RoomId, RoomStatus, SessionId};

/// Errors that can occur during room operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("Room {0} not found")]
    NotFound(RoomId),

    /// Nobody may join while a race is running.
    #[error("Race already in progress")]
    RaceInProgress,

    /// The status machine has no edge between these states.
    #[error("Cannot move room from {from} to {to}")]
    InvalidTransition { from: RoomStatus, to: RoomStatus },

    /// A race needs at least one participant.
    #[error("Cannot start a race without participants")]
    NoParticipants,

    /// The session id is not in this room.
    #[error("Participant {0} not in room")]
    ParticipantNotFound(SessionId),

    /// The session id is already in this room.
    #[error("Participant {0} already in room")]
    AlreadyJoined(SessionId),

    /// Settings may only change in the lobby.
    #[error("Settings can only be changed in the lobby (room is {0})")]
    ConfigLocked(RoomStatus),

    /// The requested race settings are out of range.
    #[error("Invalid race settings")]
    InvalidConfig,

    /// A privileged action was requested by someone other than the host.
    #[error("Only the host can {0}")]
    NotHost(&'static str),

    /// The race clock never started for this room.
    #[error("Race has not started")]
    RaceNotStarted,

    /// The room's actor has stopped or its channel is closed.
    #[error("Room {0} is unavailable")]
    Unavailable(RoomId),
}
