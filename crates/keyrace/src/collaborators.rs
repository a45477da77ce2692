//! Outside services the server leans on: where race text comes from and
//! where finished results go.
//!
//! Both are traits so a deployment can plug in its own word lists and
//! database. The bundled implementations keep the server runnable on its
//! own and are what the tests use.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use keyrace_protocol::{ReplayEvent, UserId};
use rand::Rng;
use tokio::sync::Mutex;

use crate::KeyraceError;

// ---------------------------------------------------------------------------
// Word supply
// ---------------------------------------------------------------------------

/// Supplies race text.
pub trait WordSource: Send + Sync + 'static {
    /// Returns exactly `count` words.
    fn get_words(&self, count: usize) -> impl Future<Output = Vec<String>> + Send;
}

/// Common English words, sampled uniformly.
const COMMON_WORDS: &[&str] = &[
    "the", "be", "of", "and", "a", "to", "in", "he", "have", "it", "that", "for", "they", "with",
    "as", "not", "on", "she", "at", "by", "this", "we", "you", "do", "but", "from", "or", "which",
    "one", "would", "all", "will", "there", "say", "who", "make", "when", "can", "more", "if",
    "no", "man", "out", "other", "so", "what", "time", "up", "go", "about", "than", "into",
    "could", "state", "only", "new", "year", "some", "take", "come", "these", "know", "see",
    "use", "get", "like", "then", "first", "any", "work", "now", "may", "such", "give", "over",
    "think", "most", "even", "find", "day", "also", "after", "way", "many", "must", "look",
    "before", "great", "back", "through", "long", "where", "much", "should", "well", "people",
    "down", "own", "just", "because", "good", "each", "those", "feel", "seem", "how", "high",
    "too", "place", "little", "world", "very", "still", "nation", "hand", "old", "life", "tell",
    "write", "become", "here", "show", "house", "both", "between", "need", "mean", "call",
    "develop", "under", "last", "right", "move", "thing", "general", "school", "never", "same",
    "another", "begin", "while", "number", "part", "turn", "real", "leave", "might", "want",
    "point", "form", "off", "child", "few", "small", "since", "against", "ask", "late", "home",
    "interest", "large", "person", "end", "open", "public", "follow", "during", "present",
    "without", "again", "hold", "govern", "around", "possible", "head", "consider", "word",
    "program", "problem", "however", "lead", "system", "set", "order", "eye", "plan", "run",
    "keep", "face", "fact", "group", "play", "stand", "increase", "early", "course", "change",
    "help", "line",
];

/// A [`WordSource`] drawing from a fixed word list.
#[derive(Debug, Clone)]
pub struct StaticWordSource {
    words: Vec<String>,
}

impl StaticWordSource {
    /// Uses the given list. An empty list falls back to the built-in one.
    pub fn new(words: Vec<String>) -> Self {
        if words.is_empty() {
            return Self::default();
        }
        Self { words }
    }

    fn sample(&self, count: usize) -> Vec<String> {
        let mut rng = rand::rng();
        (0..count)
            .map(|_| self.words[rng.random_range(0..self.words.len())].clone())
            .collect()
    }
}

impl Default for StaticWordSource {
    fn default() -> Self {
        Self {
            words: COMMON_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl WordSource for StaticWordSource {
    async fn get_words(&self, count: usize) -> Vec<String> {
        self.sample(count)
    }
}

// ---------------------------------------------------------------------------
// Result persistence
// ---------------------------------------------------------------------------

/// A finished attempt, with server-computed figures.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    /// `None` for guests.
    pub user_id: Option<UserId>,
    pub preset_id: Option<String>,
    pub wpm: f64,
    pub raw: f64,
    /// Speed over fully correct words only.
    pub net_wpm: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub afk_duration: f64,
    pub replay_data: Vec<ReplayEvent>,
    pub target_text: String,
    pub hash: String,
}

/// A stored result.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: u64,
    pub record: ResultRecord,
}

/// Where results are kept.
pub trait ResultStore: Send + Sync + 'static {
    /// Saves a result. Returns `Ok(None)` without storing anything when
    /// the record has no `user_id`.
    fn save_result(
        &self,
        record: ResultRecord,
    ) -> impl Future<Output = Result<Option<StoredResult>, KeyraceError>> + Send;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResultStore;

impl ResultStore for NoopResultStore {
    async fn save_result(&self, _record: ResultRecord) -> Result<Option<StoredResult>, KeyraceError> {
        Ok(None)
    }
}

/// Keeps results in memory, optionally up to a fixed number.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    next_id: AtomicU64,
    results: Mutex<Vec<StoredResult>>,
    limit: Option<usize>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses new results once it holds `limit` of them.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Everything stored so far, oldest first.
    pub async fn results(&self) -> Vec<StoredResult> {
        self.results.lock().await.clone()
    }
}

impl ResultStore for InMemoryResultStore {
    async fn save_result(&self, record: ResultRecord) -> Result<Option<StoredResult>, KeyraceError> {
        if record.user_id.is_none() {
            return Ok(None);
        }
        let mut results = self.results.lock().await;
        if self.limit.is_some_and(|limit| results.len() >= limit) {
            return Err(KeyraceError::Store(format!(
                "result store is full ({} results)",
                results.len()
            )));
        }
        let stored = StoredResult {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            record,
        };
        results.push(stored.clone());
        Ok(Some(stored))
    }
}

/// Shared stores work too, so tests can keep a handle for inspection.
impl<T: ResultStore> ResultStore for std::sync::Arc<T> {
    fn save_result(
        &self,
        record: ResultRecord,
    ) -> impl Future<Output = Result<Option<StoredResult>, KeyraceError>> + Send {
        (**self).save_result(record)
    }
}
