//! Shared race vocabulary: identities, race configuration, room status,
//! keystroke replay events, and the snapshot views sent to clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Short, human-shareable room code (e.g. `"K7Q2ZD"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Normalizes a user-typed code: trims whitespace and uppercases it.
    pub fn normalized(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral per-connection participant identity, generated by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an authenticated account, as resolved from a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// RaceConfig
// ---------------------------------------------------------------------------

/// How a race is bounded.
///
/// On the wire this is internally tagged by `mode`:
/// `{"mode":"WORDS","wordCount":25}` or `{"mode":"TIME","durationSeconds":30}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "UPPERCASE", rename_all_fields = "camelCase")]
pub enum RaceConfig {
    /// Finish after typing a fixed number of words.
    Words { word_count: u32 },
    /// Finish when a fixed amount of wall-clock time has elapsed.
    Time { duration_seconds: u32 },
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self::Words { word_count: 25 }
    }
}

impl RaceConfig {
    /// Returns `true` if the numbers in the config are usable.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Words { word_count } => (1..=1000).contains(&word_count),
            Self::Time { duration_seconds } => (1..=3600).contains(&duration_seconds),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomStatus
// ---------------------------------------------------------------------------

/// Where a room is in its race lifecycle.
///
/// ```text
///           ┌──────── cancel ───────┐
///           ▼                       │
///   LOBBY ──► COUNTDOWN ──► RACING ──► FINISHED
///     ▲                       │           │
///     ├────── force stop ─────┘           │
///     └────────────── restart ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomStatus {
    Lobby,
    Countdown,
    Racing,
    Finished,
}

impl RoomStatus {
    /// Returns `true` if moving from `self` to `target` is a legal edge.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Lobby, Self::Countdown)
                | (Self::Countdown, Self::Racing)
                | (Self::Countdown, Self::Lobby)
                | (Self::Racing, Self::Finished)
                | (Self::Racing, Self::Lobby)
                | (Self::Finished, Self::Lobby)
        )
    }

    /// Returns `true` if new participants may join.
    pub fn is_joinable(self) -> bool {
        !matches!(self, Self::Racing)
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lobby => write!(f, "LOBBY"),
            Self::Countdown => write!(f, "COUNTDOWN"),
            Self::Racing => write!(f, "RACING"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReplayEvent
// ---------------------------------------------------------------------------

/// One recorded keystroke.
///
/// `confirmed_index` is the client's locked-in prefix length at the moment
/// of the keystroke; a Backspace never erases below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEvent {
    pub key: String,
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ctrl_key: bool,
    #[serde(default)]
    pub confirmed_index: usize,
}

impl ReplayEvent {
    /// A plain keystroke with no modifiers.
    pub fn key(key: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            ctrl_key: false,
            confirmed_index: 0,
        }
    }

    /// A Backspace, optionally with ctrl held.
    pub fn backspace(timestamp_ms: i64, ctrl_key: bool, confirmed_index: usize) -> Self {
        Self {
            key: "Backspace".to_string(),
            timestamp_ms,
            ctrl_key,
            confirmed_index,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot views
// ---------------------------------------------------------------------------

/// A participant as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub session_id: SessionId,
    pub username: String,
    pub is_host: bool,
    pub progress: f64,
    pub wpm: f64,
    pub accuracy: f64,
    pub rank: Option<u32>,
    pub finished_at: Option<Timestamp>,
}

/// Full room state as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub status: RoomStatus,
    pub participants: Vec<ParticipantView>,
    pub config: RaceConfig,
    pub text: Vec<String>,
}

/// One row of the final standings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub session_id: SessionId,
    pub username: String,
    pub rank: Option<u32>,
    pub wpm: f64,
    pub accuracy: f64,
    pub progress: f64,
}
