//! The room aggregate: participants, text, settings, and race status.
//!
//! Every race-affecting change goes through a method here. Methods check
//! everything they need before touching state, so a failed call leaves
//! the room exactly as it was. Time is passed in (`now`, milliseconds)
//! rather than read from a clock; scheduling is the server's job.

use std::collections::HashMap;

use keyrace_protocol::{
    LeaderboardEntry, ParticipantView, RaceConfig, ReplayEvent, RoomId, RoomSnapshot, RoomStatus,
    SessionId, Timestamp, UserId,
};
use keyrace_stats::FinalStats;

use crate::{Participant, RaceStats, RaceStrategy, RoomError};

/// What [`Room::update_participant_progress`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressOutcome {
    /// This update put the participant over the line.
    pub participant_finished: bool,
    /// Everyone is now done and the room moved to FINISHED.
    pub race_finished: bool,
}

/// A participant who left, and who took over as host if it was them.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub participant: Participant,
    pub new_host: Option<SessionId>,
}

/// A single race instance.
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    status: RoomStatus,
    config: RaceConfig,
    text: Vec<String>,
    participants: HashMap<SessionId, Participant>,
    race_started_at: Option<Timestamp>,
    preset_id: Option<String>,
    last_activity: Timestamp,
    next_seq: u64,
    /// Rank for the next finisher. Only goes up during a race, even when
    /// finishers leave.
    next_rank: u32,
}

impl Room {
    /// Creates an empty room in the lobby.
    pub fn new(
        id: RoomId,
        config: RaceConfig,
        text: Vec<String>,
        preset_id: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            status: RoomStatus::Lobby,
            config,
            text,
            participants: HashMap::new(),
            race_started_at: None,
            preset_id,
            last_activity: now,
            next_seq: 0,
            next_rank: 1,
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn config(&self) -> RaceConfig {
        self.config
    }

    pub fn text(&self) -> &[String] {
        &self.text
    }

    /// The target words joined with single spaces.
    pub fn joined_text(&self) -> String {
        self.text.join(" ")
    }

    pub fn race_started_at(&self) -> Option<Timestamp> {
        self.race_started_at
    }

    pub fn preset_id(&self) -> Option<&str> {
        self.preset_id.as_deref()
    }

    /// Last time anyone joined or did anything here.
    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    pub fn participant(&self, session_id: &SessionId) -> Option<&Participant> {
        self.participants.get(session_id)
    }

    /// Participants in order of arrival.
    pub fn participants(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by_key(|p| p.seq);
        list
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn host(&self) -> Option<&Participant> {
        self.participants.values().find(|p| p.is_host())
    }

    pub fn is_host(&self, session_id: &SessionId) -> bool {
        self.participant(session_id).is_some_and(Participant::is_host)
    }

    /// `true` if the room has participants and all of them are done.
    pub fn all_finished(&self) -> bool {
        !self.participants.is_empty() && self.participants.values().all(Participant::is_finished)
    }

    /// The active race mode, derived fresh from the current settings.
    pub fn strategy(&self) -> RaceStrategy {
        RaceStrategy::from(&self.config)
    }

    // -- membership ---------------------------------------------------------

    /// Adds a participant. The first one in becomes host.
    ///
    /// # Errors
    /// - [`RoomError::RaceInProgress`] while RACING
    /// - [`RoomError::AlreadyJoined`] for a duplicate session id
    pub fn add_participant(
        &mut self,
        session_id: SessionId,
        username: impl Into<String>,
        user_id: Option<UserId>,
        now: Timestamp,
    ) -> Result<&Participant, RoomError> {
        if !self.status.is_joinable() {
            return Err(RoomError::RaceInProgress);
        }
        if self.participants.contains_key(&session_id) {
            return Err(RoomError::AlreadyJoined(session_id));
        }

        let mut participant =
            Participant::new(session_id.clone(), username.into(), user_id, now, self.next_seq);
        self.next_seq += 1;
        participant.set_host(self.participants.is_empty());
        self.last_activity = self.last_activity.max(now);

        tracing::info!(
            room_id = %self.id,
            %session_id,
            username = participant.username(),
            host = participant.is_host(),
            "participant joined"
        );
        Ok(self.participants.entry(session_id).or_insert(participant))
    }

    /// Removes a participant, promoting the longest-present remaining
    /// participant if the host left. Returns `None` if they weren't here.
    pub fn remove_participant(&mut self, session_id: &SessionId) -> Option<Departure> {
        let participant = self.participants.remove(session_id)?;

        let new_host = if participant.is_host() {
            let next = self.participants.values_mut().min_by_key(|p| p.seq);
            next.map(|p| {
                p.set_host(true);
                p.session_id().clone()
            })
        } else {
            None
        };

        tracing::info!(
            room_id = %self.id,
            %session_id,
            remaining = self.participants.len(),
            "participant left"
        );
        if let Some(host) = &new_host {
            tracing::info!(room_id = %self.id, session_id = %host, "host promoted");
        }
        Some(Departure {
            participant,
            new_host,
        })
    }

    /// Makes `target` the only host. Returns `false` if `target` isn't here.
    pub fn transfer_host(&mut self, target: &SessionId) -> bool {
        if !self.participants.contains_key(target) {
            return false;
        }
        for (id, p) in &mut self.participants {
            p.set_host(id == target);
        }
        true
    }

    /// Records activity from a participant.
    pub fn touch(&mut self, session_id: &SessionId, now: Timestamp) {
        if let Some(p) = self.participants.get_mut(session_id) {
            p.touch(now);
            self.last_activity = self.last_activity.max(now);
        }
    }

    /// Removes lobby participants idle for longer than `threshold_ms`.
    /// Does nothing outside the lobby.
    pub fn prune_idle(&mut self, now: Timestamp, threshold_ms: u64) -> Vec<Departure> {
        if self.status != RoomStatus::Lobby {
            return Vec::new();
        }
        let stale: Vec<SessionId> = self
            .participants()
            .into_iter()
            .filter(|p| p.is_idle(now, threshold_ms))
            .map(|p| p.session_id().clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| self.remove_participant(id))
            .collect()
    }

    // -- race lifecycle -----------------------------------------------------

    fn transition(&mut self, to: RoomStatus) -> Result<(), RoomError> {
        if !self.status.can_transition_to(to) {
            return Err(RoomError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        tracing::debug!(room_id = %self.id, from = %self.status, %to, "status changed");
        self.status = to;
        Ok(())
    }

    /// LOBBY → COUNTDOWN. The race clock starts later, in
    /// [`start_racing`](Self::start_racing).
    ///
    /// # Errors
    /// [`RoomError::InvalidTransition`] outside the lobby,
    /// [`RoomError::NoParticipants`] in an empty room.
    pub fn start_race(&mut self) -> Result<(), RoomError> {
        if !self.status.can_transition_to(RoomStatus::Countdown) {
            return Err(RoomError::InvalidTransition {
                from: self.status,
                to: RoomStatus::Countdown,
            });
        }
        if self.participants.is_empty() {
            return Err(RoomError::NoParticipants);
        }
        self.transition(RoomStatus::Countdown)
    }

    /// COUNTDOWN → LOBBY.
    pub fn cancel_countdown(&mut self) -> Result<(), RoomError> {
        self.transition(RoomStatus::Lobby)
    }

    /// COUNTDOWN → RACING, starting the race clock at `now`.
    pub fn start_racing(&mut self, now: Timestamp) -> Result<(), RoomError> {
        self.transition(RoomStatus::Racing)?;
        self.race_started_at = Some(now);
        tracing::info!(room_id = %self.id, participants = self.participants.len(), "race started");
        Ok(())
    }

    /// RACING → FINISHED.
    pub fn finish_racing(&mut self) -> Result<(), RoomError> {
        self.transition(RoomStatus::Finished)?;
        tracing::info!(room_id = %self.id, "race finished");
        Ok(())
    }

    /// Back to the lobby with a fresh text and every participant reset.
    ///
    /// Already in the lobby this only swaps the text.
    pub fn restart(&mut self, text: Vec<String>) -> Result<(), RoomError> {
        if self.status != RoomStatus::Lobby {
            self.transition(RoomStatus::Lobby)?;
        }
        self.race_started_at = None;
        self.text = text;
        self.reset_participants();
        Ok(())
    }

    /// Swaps settings and text. Lobby only.
    ///
    /// # Errors
    /// [`RoomError::ConfigLocked`] outside the lobby,
    /// [`RoomError::InvalidConfig`] for out-of-range settings.
    pub fn update_config(&mut self, config: RaceConfig, text: Vec<String>) -> Result<(), RoomError> {
        if self.status != RoomStatus::Lobby {
            return Err(RoomError::ConfigLocked(self.status));
        }
        if !config.is_valid() {
            return Err(RoomError::InvalidConfig);
        }
        self.config = config;
        self.text = text;
        self.reset_participants();
        Ok(())
    }

    fn reset_participants(&mut self) {
        self.next_rank = 1;
        for p in self.participants.values_mut() {
            p.reset();
        }
    }

    /// Extends the text ("infinite scroll").
    pub fn append_words(&mut self, words: impl IntoIterator<Item = String>) {
        self.text.extend(words);
    }

    // -- progress and results -----------------------------------------------

    /// Applies a live progress report. A no-op unless RACING, and for
    /// participants who already finished.
    ///
    /// # Errors
    /// [`RoomError::ParticipantNotFound`] for an unknown session.
    pub fn update_participant_progress(
        &mut self,
        session_id: &SessionId,
        typed_length: usize,
        now: Timestamp,
    ) -> Result<ProgressOutcome, RoomError> {
        if !self.participants.contains_key(session_id) {
            return Err(RoomError::ParticipantNotFound(session_id.clone()));
        }
        let Some(started) = self.race_started_at.filter(|_| self.status == RoomStatus::Racing)
        else {
            return Ok(ProgressOutcome::default());
        };

        let strategy = self.strategy();
        let total = strategy.target_length(&self.text);
        // Nobody types past the end of the text.
        let typed_length = typed_length.min(total);
        let next_rank = self.next_rank;

        let Some(participant) = self.participants.get_mut(session_id) else {
            return Err(RoomError::ParticipantNotFound(session_id.clone()));
        };
        if participant.is_finished() {
            return Ok(ProgressOutcome::default());
        }

        let measured = RaceStats {
            wpm: keyrace_stats::calculate_wpm(typed_length, started, now),
            accuracy: participant.stats().accuracy,
            progress: strategy.calculate_progress(typed_length, total, Some(started), now),
        };
        let finished = strategy.is_finished(&measured, Some(started), now);
        participant.set_stats(RaceStats {
            wpm: round2(measured.wpm),
            accuracy: measured.accuracy,
            progress: round2(measured.progress),
        });
        participant.set_typed_length(typed_length);

        let mut outcome = ProgressOutcome::default();
        if finished {
            participant.finish(next_rank, now);
            self.next_rank += 1;
            outcome.participant_finished = true;
            tracing::info!(room_id = %self.id, %session_id, rank = next_rank, "participant finished");

            if self.all_finished() {
                self.finish_racing()?;
                outcome.race_finished = true;
            }
        }
        Ok(outcome)
    }

    /// Recomputes a participant's result from their keystroke log.
    ///
    /// Returns `None` if the participant is unknown or the race clock
    /// never started. Figures are rounded to two decimals.
    pub fn get_participant_final_stats(
        &self,
        session_id: &SessionId,
        events: &[ReplayEvent],
        now: Timestamp,
    ) -> Option<FinalStats> {
        self.participants.get(session_id)?;
        let started = self.race_started_at?;
        let stats = FinalStats::compute(events, &self.joined_text(), started, now);
        Some(FinalStats {
            wpm: round2(stats.wpm),
            raw: round2(stats.raw),
            net_wpm: round2(stats.net_wpm),
            accuracy: round2(stats.accuracy),
            typed_length: stats.typed_length,
        })
    }

    /// Stores authoritative speed and accuracy on a participant.
    ///
    /// # Errors
    /// [`RoomError::ParticipantNotFound`] for an unknown session.
    pub fn apply_final_stats(
        &mut self,
        session_id: &SessionId,
        stats: &FinalStats,
    ) -> Result<(), RoomError> {
        let participant = self
            .participants
            .get_mut(session_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(session_id.clone()))?;
        let progress = participant.stats().progress;
        participant.set_stats(RaceStats {
            wpm: stats.wpm,
            accuracy: stats.accuracy,
            progress,
        });
        Ok(())
    }

    // -- views --------------------------------------------------------------

    pub fn participant_views(&self) -> Vec<ParticipantView> {
        self.participants().into_iter().map(Participant::view).collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            status: self.status,
            participants: self.participant_views(),
            config: self.config,
            text: self.text.clone(),
        }
    }

    /// Final standings: finishers by rank, then everyone else by how far
    /// they got. Time-mode progress is the clock, not the typing, so there
    /// the rest are ordered by characters typed, then speed.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let by_time = matches!(self.strategy(), RaceStrategy::Time { .. });
        let mut ranked: Vec<&Participant> = self.participants();
        ranked.sort_by(|a, b| match (a.rank(), b.rank()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) if by_time => b
                .typed_length()
                .cmp(&a.typed_length())
                .then_with(|| b.stats().wpm.total_cmp(&a.stats().wpm)),
            (None, None) => b.stats().progress.total_cmp(&a.stats().progress),
        });
        ranked.into_iter().map(Participant::leaderboard_entry).collect()
    }
}

/// Rounds to two decimals.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
