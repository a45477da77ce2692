//! Pure typing metrics: replay reconstruction, speed, and accuracy.
//!
//! Nothing here holds state or reads a clock; callers pass timestamps in.

use keyrace_protocol::{ReplayEvent, Timestamp};

/// Characters per "word" in every WPM figure.
const CHARS_PER_WORD: f64 = 5.0;

const MS_PER_MINUTE: f64 = 60_000.0;

const BACKSPACE: &str = "Backspace";

/// Replays a keystroke log into the text it produced.
///
/// - A single-character key appends that character.
/// - `Backspace` removes one trailing character, never below the event's
///   own `confirmed_index`.
/// - `Backspace` with ctrl erases back to the start of the current word.
///   Trailing spaces are erased together with the word before them.
/// - Any other key (`Shift`, `Enter`, ...) is ignored.
///
/// Total: a `confirmed_index` past the end of the text just means nothing
/// can be erased.
pub fn reconstruct_typed_text(events: &[ReplayEvent]) -> String {
    let mut typed: Vec<char> = Vec::new();

    for event in events {
        if event.key == BACKSPACE {
            let floor = event.confirmed_index.min(typed.len());
            if event.ctrl_key {
                let cut = word_start(&typed[floor..]);
                typed.truncate(floor + cut);
            } else if typed.len() > floor {
                typed.pop();
            }
            continue;
        }

        let mut chars = event.key.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            typed.push(c);
        }
    }

    typed.into_iter().collect()
}

/// Where ctrl+Backspace lands inside the editable tail of the text.
///
/// If the tail ends in spaces, they go along with the word before them.
/// Otherwise only the partial word after the last space goes.
fn word_start(tail: &[char]) -> usize {
    let trimmed_len = tail
        .iter()
        .rposition(|&c| c != ' ')
        .map_or(0, |last| last + 1);
    let trimmed = &tail[..trimmed_len];

    match trimmed.iter().rposition(|&c| c == ' ') {
        Some(space) => space + 1,
        None => 0,
    }
}

/// Words per minute for `typed_length` characters typed between
/// `start_ms` and `now_ms`. Zero when no time has passed (or the clock
/// went backwards).
pub fn calculate_wpm(typed_length: usize, start_ms: Timestamp, now_ms: Timestamp) -> f64 {
    if now_ms <= start_ms {
        return 0.0;
    }
    let minutes = (now_ms - start_ms) as f64 / MS_PER_MINUTE;
    (typed_length as f64 / CHARS_PER_WORD) / minutes
}

/// Percentage of typed characters that match the target, word by word.
///
/// Words are aligned by position. Within a pair, characters are compared
/// up to the shorter word. The space after a word counts as correct when
/// both sides continue with another word. The denominator is always the
/// typed length, so stopping early earns nothing. Empty input scores 100.
pub fn calculate_accuracy(typed: &str, target: &str) -> f64 {
    let typed_len = typed.chars().count();
    if typed_len == 0 {
        return 100.0;
    }

    let typed_words: Vec<&str> = typed.split(' ').collect();
    let target_words: Vec<&str> = target.split(' ').collect();

    let mut correct = 0usize;
    for (i, (typed_word, target_word)) in typed_words.iter().zip(&target_words).enumerate() {
        correct += typed_word
            .chars()
            .zip(target_word.chars())
            .filter(|(a, b)| a == b)
            .count();
        if i + 1 < typed_words.len() && i + 1 < target_words.len() {
            correct += 1;
        }
    }

    (correct as f64 / typed_len as f64 * 100.0).clamp(0.0, 100.0)
}

/// Characters that count toward corrected speed: only words typed exactly
/// right, plus the space after each of them when both sides go on.
pub fn calculate_correct_characters(typed: &str, target: &str) -> usize {
    let typed_words: Vec<&str> = typed.split(' ').collect();
    let target_words: Vec<&str> = target.split(' ').collect();

    typed_words
        .iter()
        .zip(&target_words)
        .enumerate()
        .filter(|(_, (typed_word, target_word))| typed_word == target_word)
        .map(|(i, (word, _))| {
            let space = usize::from(i + 1 < typed_words.len() && i + 1 < target_words.len());
            word.chars().count() + space
        })
        .sum()
}

/// Every printable keystroke in the log, including ones later erased.
pub fn count_keystrokes(events: &[ReplayEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            let mut chars = e.key.chars();
            matches!((chars.next(), chars.next()), (Some(_), None))
        })
        .count()
}

/// Server-side figures for one finished attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalStats {
    /// Speed over the reconstructed text.
    pub wpm: f64,
    /// Speed over every keystroke, corrections included.
    pub raw: f64,
    /// Speed over fully correct words only.
    pub net_wpm: f64,
    /// Word-aligned character accuracy.
    pub accuracy: f64,
    /// Length of the reconstructed text.
    pub typed_length: usize,
}

impl FinalStats {
    /// Derives every figure from the raw keystroke log.
    pub fn compute(
        events: &[ReplayEvent],
        target_text: &str,
        start_ms: Timestamp,
        end_ms: Timestamp,
    ) -> Self {
        let typed = reconstruct_typed_text(events);
        let typed_length = typed.chars().count();
        let correct = calculate_correct_characters(&typed, target_text);
        Self {
            wpm: calculate_wpm(typed_length, start_ms, end_ms),
            raw: calculate_wpm(count_keystrokes(events), start_ms, end_ms),
            net_wpm: calculate_wpm(correct, start_ms, end_ms),
            accuracy: calculate_accuracy(&typed, target_text),
            typed_length,
        }
    }
}
