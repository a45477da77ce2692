//! Race modes: how progress is measured and when a participant is done.
//!
//! The strategy is a pure function of [`RaceConfig`]. Rooms derive it on
//! every call instead of storing it, so a settings change can never leave
//! a stale strategy behind.

use keyrace_protocol::{RaceConfig, Timestamp};

use crate::RaceStats;

/// The progress policy for one race mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceStrategy {
    /// Done when the first `word_count` words are typed.
    Words { word_count: usize },
    /// Done when `duration_ms` of race time has elapsed.
    Time { duration_ms: u64 },
}

impl From<&RaceConfig> for RaceStrategy {
    fn from(config: &RaceConfig) -> Self {
        match *config {
            RaceConfig::Words { word_count } => Self::Words {
                word_count: word_count as usize,
            },
            RaceConfig::Time { duration_seconds } => Self::Time {
                duration_ms: u64::from(duration_seconds) * 1_000,
            },
        }
    }
}

impl RaceStrategy {
    /// Length of the text a participant has to type, in characters.
    ///
    /// In words mode only the configured number of words counts, so words
    /// appended mid-race never move the finish line.
    pub fn target_length(&self, text: &[String]) -> usize {
        let words = match *self {
            Self::Words { word_count } => &text[..word_count.min(text.len())],
            Self::Time { .. } => text,
        };
        let letters: usize = words.iter().map(|w| w.chars().count()).sum();
        letters + words.len().saturating_sub(1)
    }

    /// Progress in percent, 0 to 100.
    pub fn calculate_progress(
        &self,
        typed_length: usize,
        total_target_length: usize,
        race_started_at: Option<Timestamp>,
        now: Timestamp,
    ) -> f64 {
        match *self {
            Self::Words { .. } => {
                if total_target_length == 0 {
                    return 0.0;
                }
                (typed_length as f64 / total_target_length as f64 * 100.0).min(100.0)
            }
            Self::Time { duration_ms } => {
                let Some(started) = race_started_at else {
                    return 0.0;
                };
                if duration_ms == 0 {
                    return 100.0;
                }
                let elapsed = now.saturating_sub(started);
                (elapsed as f64 / duration_ms as f64 * 100.0).min(100.0)
            }
        }
    }

    /// Whether a participant with these stats is done.
    pub fn is_finished(
        &self,
        stats: &RaceStats,
        race_started_at: Option<Timestamp>,
        now: Timestamp,
    ) -> bool {
        match *self {
            Self::Words { .. } => stats.progress >= 100.0,
            Self::Time { duration_ms } => race_started_at
                .is_some_and(|started| now.saturating_sub(started) >= duration_ms),
        }
    }
}
