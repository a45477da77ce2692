//! A participant: one connection's identity and live stats in a room.

use keyrace_protocol::{LeaderboardEntry, ParticipantView, SessionId, Timestamp, UserId};

/// Live race figures. Always replaced as a whole, never field by field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaceStats {
    pub wpm: f64,
    /// Percent, 0 to 100.
    pub accuracy: f64,
    /// Percent, 0 to 100.
    pub progress: f64,
}

impl Default for RaceStats {
    /// Nothing typed yet: no speed, no errors, no progress.
    fn default() -> Self {
        Self {
            wpm: 0.0,
            accuracy: 100.0,
            progress: 0.0,
        }
    }
}

/// One participant. Owned by exactly one [`Room`](crate::Room).
///
/// Host flag, rank, and finish time are only changed by the room, which
/// keeps the "one host" and "ranks are never reassigned" rules.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    session_id: SessionId,
    username: String,
    user_id: Option<UserId>,
    is_host: bool,
    stats: RaceStats,
    finished_at: Option<Timestamp>,
    rank: Option<u32>,
    /// Characters typed as of the last progress report.
    typed_length: usize,
    last_active_at: Timestamp,
    /// Order of arrival in the room.
    pub(crate) seq: u64,
}

impl Participant {
    pub(crate) fn new(
        session_id: SessionId,
        username: String,
        user_id: Option<UserId>,
        now: Timestamp,
        seq: u64,
    ) -> Self {
        Self {
            session_id,
            username,
            user_id,
            is_host: false,
            stats: RaceStats::default(),
            finished_at: None,
            rank: None,
            typed_length: 0,
            last_active_at: now,
            seq,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Set only when the join credential was accepted.
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn stats(&self) -> RaceStats {
        self.stats
    }

    pub fn rank(&self) -> Option<u32> {
        self.rank
    }

    pub fn typed_length(&self) -> usize {
        self.typed_length
    }

    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    pub fn last_active_at(&self) -> Timestamp {
        self.last_active_at
    }

    /// `true` once a rank has been assigned.
    pub fn is_finished(&self) -> bool {
        self.rank.is_some()
    }

    /// `true` if nothing was heard from this participant for longer than
    /// `threshold_ms`.
    pub fn is_idle(&self, now: Timestamp, threshold_ms: u64) -> bool {
        now.saturating_sub(self.last_active_at) > threshold_ms
    }

    pub(crate) fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub(crate) fn set_stats(&mut self, stats: RaceStats) {
        self.stats = stats;
    }

    pub(crate) fn set_typed_length(&mut self, typed_length: usize) {
        self.typed_length = typed_length;
    }

    /// Records the finish. A rank, once given, is kept.
    pub(crate) fn finish(&mut self, rank: u32, at: Timestamp) {
        if self.rank.is_none() {
            self.rank = Some(rank);
            self.finished_at = Some(at);
        }
    }

    /// Clears everything from the previous race.
    pub(crate) fn reset(&mut self) {
        self.stats = RaceStats::default();
        self.rank = None;
        self.finished_at = None;
        self.typed_length = 0;
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.last_active_at = self.last_active_at.max(now);
    }

    /// The client-facing view.
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            is_host: self.is_host,
            progress: self.stats.progress,
            wpm: self.stats.wpm,
            accuracy: self.stats.accuracy,
            rank: self.rank,
            finished_at: self.finished_at,
        }
    }

    pub(crate) fn leaderboard_entry(&self) -> LeaderboardEntry {
        LeaderboardEntry {
            session_id: self.session_id.clone(),
            username: self.username.clone(),
            rank: self.rank,
            wpm: self.stats.wpm,
            accuracy: self.stats.accuracy,
            progress: self.stats.progress,
        }
    }
}
