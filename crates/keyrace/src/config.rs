//! Server configuration: defaults, plus overrides from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use keyrace_protocol::RaceConfig;
use keyrace_stats::Tolerance;
use tracing::warn;

/// Environment variable for the listen address.
pub const BIND_ENV: &str = "KEYRACE_BIND";
/// Environment variable for the result-signing secret.
pub const RESULT_SECRET_ENV: &str = "KEYRACE_RESULT_SECRET";
/// Environment variable for the empty-room grace period, in seconds.
/// `0` deletes empty rooms immediately.
pub const GRACE_SECS_ENV: &str = "KEYRACE_GRACE_SECS";
/// Environment variable for the heartbeat interval, in seconds.
pub const HEARTBEAT_SECS_ENV: &str = "KEYRACE_HEARTBEAT_SECS";
/// Environment variable for the pre-race countdown, in milliseconds.
pub const COUNTDOWN_MS_ENV: &str = "KEYRACE_COUNTDOWN_MS";

/// Everything tunable about a running server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind: String,
    /// How long a new socket gets to send its WebSocket upgrade request.
    pub handshake_timeout: Duration,
    /// Delay between START_RACE and the race clock starting.
    pub countdown: Duration,
    /// How long an empty room survives before deletion. `None` deletes
    /// it as soon as the last participant leaves.
    pub grace_period: Option<Duration>,
    /// How often connections are pinged.
    pub heartbeat_interval: Duration,
    /// How often lobbies are checked for idle participants.
    pub sweep_interval: Duration,
    /// Lobby participants quiet for longer than this are removed.
    pub idle_threshold: Duration,
    /// Settings for rooms created without any.
    pub default_race: RaceConfig,
    /// Words fetched up front for a time-mode race.
    pub time_mode_batch: usize,
    /// Words appended per LOAD_MORE_WORDS.
    pub load_more_batch: usize,
    /// Shared secret for result digests. Without it, digests aren't checked.
    pub result_secret: Option<String>,
    /// Claimed-vs-measured margin. `None` skips the check.
    pub tolerance: Option<Tolerance>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            handshake_timeout: Duration::from_secs(10),
            countdown: Duration::from_secs(3),
            grace_period: Some(Duration::from_secs(10)),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(5 * 60),
            default_race: RaceConfig::default(),
            time_mode_batch: 100,
            load_more_batch: 50,
            result_secret: None,
            tolerance: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by whatever `KEYRACE_*` variables are set.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = lookup(BIND_ENV).filter(|v| !v.trim().is_empty()) {
            config.bind = bind;
        }
        if let Some(secret) = lookup(RESULT_SECRET_ENV).filter(|v| !v.is_empty()) {
            config.result_secret = Some(secret);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, GRACE_SECS_ENV) {
            config.grace_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, HEARTBEAT_SECS_ENV) {
            if secs > 0 {
                config.heartbeat_interval = Duration::from_secs(secs);
            } else {
                warn!(var = HEARTBEAT_SECS_ENV, "heartbeat interval must be positive; keeping default");
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, COUNTDOWN_MS_ENV) {
            config.countdown = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "invalid value; falling back to default");
            None
        }
    }
}
