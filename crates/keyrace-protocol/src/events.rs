//! Inbound and outbound wire events.
//!
//! Every frame is a JSON object `{"type": "...", "payload": {...}}`.
//! Inbound frames are decoded in two steps: first the [`Envelope`], then
//! the payload for the named type. That lets the server tell an unknown
//! event type (ignored) apart from a known type with a broken payload
//! (logged and dropped).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    LeaderboardEntry, ParticipantView, ProtocolError, RaceConfig, ReplayEvent, RoomId,
    RoomSnapshot, SessionId, Timestamp,
};

/// The outer shape of every inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    #[serde(default)]
    pub config: Option<RaceConfig>,
    #[serde(default)]
    pub preset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub username: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgress {
    pub typed_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSettings {
    pub config: RaceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHost {
    pub target_id: SessionId,
}

/// A finished race as the client reports it.
///
/// Everything except `replay_data` is only trusted as far as the digest
/// check goes; the server recomputes speed and accuracy from the replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub wpm: f64,
    pub raw: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub consistency: f64,
    #[serde(default)]
    pub replay_data: Vec<ReplayEvent>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    #[serde(default)]
    pub afk_duration: f64,
    #[serde(default)]
    pub hash: String,
}

/// Everything a client can ask the server to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CreateRoom(CreateRoom),
    JoinRoom(JoinRoom),
    StartRace,
    UpdateProgress(UpdateProgress),
    UpdateSettings(UpdateSettings),
    TransferHost(TransferHost),
    LoadMoreWords,
    SubmitResult(Box<SubmitResult>),
    LeaveRoom,
    RestartGame,
}

impl ClientEvent {
    /// Interprets an envelope.
    ///
    /// Returns `Ok(None)` for event types this server doesn't know.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] when a known type carries a
    /// payload that doesn't fit it.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Envelope { kind, payload } = envelope;
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let event = match kind.as_str() {
            "CREATE_ROOM" => Self::CreateRoom(parse(payload)?),
            "JOIN_ROOM" => Self::JoinRoom(parse(payload)?),
            "START_RACE" => Self::StartRace,
            "UPDATE_PROGRESS" => Self::UpdateProgress(parse(payload)?),
            "UPDATE_SETTINGS" => Self::UpdateSettings(parse(payload)?),
            "TRANSFER_HOST" => Self::TransferHost(parse(payload)?),
            "LOAD_MORE_WORDS" => Self::LoadMoreWords,
            "SUBMIT_RESULT" => Self::SubmitResult(Box::new(parse(payload)?)),
            "LEAVE_ROOM" => Self::LeaveRoom,
            "RESTART_GAME" => Self::RestartGame,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// The wire name of this event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "CREATE_ROOM",
            Self::JoinRoom(_) => "JOIN_ROOM",
            Self::StartRace => "START_RACE",
            Self::UpdateProgress(_) => "UPDATE_PROGRESS",
            Self::UpdateSettings(_) => "UPDATE_SETTINGS",
            Self::TransferHost(_) => "TRANSFER_HOST",
            Self::LoadMoreWords => "LOAD_MORE_WORDS",
            Self::SubmitResult(_) => "SUBMIT_RESULT",
            Self::LeaveRoom => "LEAVE_ROOM",
            Self::RestartGame => "RESTART_GAME",
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(ProtocolError::Decode)
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Everything the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Reply to `CREATE_ROOM`.
    RoomCreated { room_id: RoomId },
    /// Full snapshot sent to a connection that just joined, with its own
    /// session id.
    RoomState {
        session_id: SessionId,
        #[serde(flatten)]
        room: RoomSnapshot,
    },
    /// Full snapshot broadcast after a room-wide change.
    RoomUpdate(RoomSnapshot),
    PlayerJoined { participant: ParticipantView },
    PlayerLeft { session_id: SessionId },
    CountdownStart { start_time: Timestamp },
    RaceStart {},
    ProgressUpdate { participants: Vec<ParticipantView> },
    RaceFinished { leaderboard: Vec<LeaderboardEntry> },
    WordsAppended { words: Vec<String> },
    HostPromoted { message: String },
    ResultSaved { success: bool },
    Error { message: String },
}

impl ServerEvent {
    /// Shorthand for an [`ServerEvent::Error`] reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
