//! Timers for Keyrace rooms.
//!
//! Two tools live here:
//!
//! - [`TimerSet`] — one-shot, keyed, cancelable delays. Used for the race
//!   countdown, the time-mode limit, and deferred deletion of empty rooms.
//! - [`Ticker`] — a fixed-period beat for server-wide sweeps (heartbeat
//!   pings, inactivity pruning).
//!
//! # Cancellation is cooperative
//!
//! Canceling a timer only stops it while it is still waiting. Once the
//! delay has elapsed its task runs to completion, so callbacks must
//! re-check room state before acting. A callback may freely cancel or
//! reschedule timers, including its own key.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// TimerSet
// ---------------------------------------------------------------------------

/// A pending timer. Dropping `cancel` wakes the waiting task and stops it.
struct Pending {
    cancel: oneshot::Sender<()>,
}

impl Pending {
    /// `true` while the task is still waiting for its delay.
    fn is_waiting(&self) -> bool {
        !self.cancel.is_closed()
    }
}

/// Keyed one-shot timers.
///
/// At most one timer is pending per key: scheduling under a key that is
/// already pending cancels the older one.
pub struct TimerSet<K> {
    pending: HashMap<K, Pending>,
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Creates an empty timer set.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Runs `task` after `delay` unless the key is canceled first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&mut self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.prune();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        if self.pending.insert(key.clone(), Pending { cancel: cancel_tx }).is_some() {
            debug!(?key, "timer replaced");
        }

        let label = key;
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = cancel_rx => {
                    trace!(key = ?label, "timer canceled");
                    return;
                }
            }
            trace!(key = ?label, "timer fired");
            task.await;
        });
    }

    /// Cancels the timer under `key`.
    ///
    /// Returns `true` if it was still waiting.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                let was_waiting = pending.is_waiting();
                drop(pending);
                was_waiting
            }
            None => false,
        }
    }

    /// Cancels every timer whose key matches `pred`.
    ///
    /// Returns how many were still waiting.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let keys: Vec<K> = self.pending.keys().filter(|k| pred(k)).cloned().collect();
        keys.iter().filter(|k| self.cancel(k)).count()
    }

    /// `true` if a timer under `key` is still waiting.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.get(key).is_some_and(Pending::is_waiting)
    }

    /// Number of timers still waiting.
    pub fn len(&self) -> usize {
        self.pending.values().filter(|p| p.is_waiting()).count()
    }

    /// `true` if no timer is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets entries whose tasks already fired.
    fn prune(&mut self) {
        self.pending.retain(|_, p| p.is_waiting());
    }
}

impl<K> Default for TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Configuration for a [`Ticker`].
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Time between beats.
    pub period: Duration,
    /// Random delay (0..max) added before the first beat so sweeps started
    /// together don't line up.
    pub initial_jitter: Duration,
}

impl TickerConfig {
    /// A ticker with the given period and no jitter.
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            initial_jitter: Duration::ZERO,
        }
    }
}

/// A fixed-period beat that skips missed beats instead of bursting.
pub struct Ticker {
    period: Duration,
    next: Instant,
    beats: u64,
}

impl Ticker {
    /// Creates a ticker; the first beat is one period (plus jitter) away.
    ///
    /// A zero period is raised to one millisecond.
    pub fn new(config: TickerConfig) -> Self {
        let period = config.period.max(Duration::from_millis(1));
        let jitter = if config.initial_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = config.initial_jitter.as_micros() as u64;
            Duration::from_micros(rand::rng().random_range(0..max.max(1)))
        };
        debug!(period_ms = period.as_millis() as u64, "ticker created");
        Self {
            period,
            next: Instant::now() + period + jitter,
            beats: 0,
        }
    }

    /// Waits for the next beat and returns its number (starting at 1).
    pub async fn tick(&mut self) -> u64 {
        time::sleep_until(self.next).await;
        let now = Instant::now();
        // Schedule from now, not from the missed deadline.
        self.next = now + self.period;
        self.beats += 1;
        self.beats
    }

    /// Beats so far.
    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        self.period
    }
}
