//! `KeyraceServer` builder and server loop.
//!
//! This is the entry point for running a race server. It ties together
//! all the layers: transport → protocol → session → room, and owns the
//! background work: heartbeat pings, the idle-lobby sweep, and the
//! per-room timers.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keyrace_protocol::{JsonCodec, RaceConfig, RoomId, RoomSnapshot, RoomStatus, ServerEvent, Timestamp};
use keyrace_room::{
    InMemoryRoomDirectory, Room, RoomContext, RoomDirectory, RoomError, generate_room_id,
    spawn_room,
};
use keyrace_session::{Authenticator, GuestOnly, SessionRegistry};
use keyrace_timer::{Ticker, TickerConfig, TimerSet};
use keyrace_transport::{Incoming, Transport, WebSocketTransport};
use tokio::sync::Mutex;

use crate::handler::handle_connection;
use crate::{
    KeyraceError, NoopResultStore, ResultStore, ServerConfig, StaticWordSource, WordSource,
};

/// How many random room codes to try before giving up.
const MAX_ROOM_ID_ATTEMPTS: usize = 16;

/// Message sent to a participant who just became host.
pub(crate) const HOST_PROMOTED_MESSAGE: &str = "You are now the host";

/// What a room timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// COUNTDOWN → RACING.
    Countdown,
    /// Time-mode race limit.
    TimeLimit,
    /// Deferred deletion of an empty room.
    Deletion,
}

pub(crate) type TimerKey = (RoomId, TimerKind);

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Locks are
/// never held across a room call or a network send.
pub(crate) struct ServerState<A, D, W, S> {
    pub(crate) config: ServerConfig,
    pub(crate) sessions: Mutex<SessionRegistry>,
    pub(crate) rooms: D,
    pub(crate) timers: Mutex<TimerSet<TimerKey>>,
    pub(crate) auth: A,
    pub(crate) words: W,
    pub(crate) results: S,
    pub(crate) codec: JsonCodec,
}

impl<A, D, W, S> ServerState<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    /// Creates a room with its initial text and stores it under a fresh
    /// code.
    pub(crate) async fn create_room(
        &self,
        config: Option<RaceConfig>,
        preset_id: Option<String>,
    ) -> Result<RoomId, KeyraceError> {
        let config = config.unwrap_or(self.config.default_race);
        if !config.is_valid() {
            return Err(RoomError::InvalidConfig.into());
        }
        let text = self.fetch_text(&config).await;

        for _ in 0..MAX_ROOM_ID_ATTEMPTS {
            let room_id = generate_room_id();
            if self.rooms.find_by_id(&room_id).await.is_some() {
                continue;
            }
            let room = Room::new(room_id.clone(), config, text.clone(), preset_id.clone(), now_ms());
            let handle = spawn_room(room);
            if self.rooms.insert_new(handle.clone()).await {
                tracing::info!(%room_id, ?config, "room created");
                return Ok(room_id);
            }
            let _ = handle.shutdown().await;
        }
        Err(KeyraceError::BadRequest("Could not allocate a room code".into()))
    }

    /// Fresh race text sized for `config`.
    pub(crate) async fn fetch_text(&self, config: &RaceConfig) -> Vec<String> {
        let count = match *config {
            RaceConfig::Words { word_count } => word_count as usize,
            RaceConfig::Time { .. } => self.config.time_mode_batch,
        };
        self.words.get_words(count).await
    }

    /// Deletes a room unless someone is in it.
    ///
    /// The emptiness check and the actor shutdown happen in one room
    /// command, so a join racing with deletion either lands first (room
    /// kept) or finds the room gone.
    pub(crate) async fn delete_if_empty(&self, room_id: &RoomId) {
        let Some(handle) = self.rooms.find_by_id(room_id).await else {
            return;
        };
        let empty = handle
            .run(|ctx| {
                let empty = ctx.room().is_empty();
                if empty {
                    ctx.close();
                }
                empty
            })
            .await;
        if let Ok(false) = empty {
            tracing::debug!(%room_id, "room repopulated, keeping it");
            return;
        }
        self.rooms.delete(room_id).await;
        self.timers.lock().await.cancel_where(|(id, _)| id == room_id);
    }

    /// Ends a time-mode race once its clock runs out.
    pub(crate) async fn expire_race(&self, room_id: &RoomId) {
        let Some(handle) = self.rooms.find_by_id(room_id).await else {
            return;
        };
        let _ = handle
            .run(|ctx| {
                if ctx.room().status() == RoomStatus::Racing {
                    tracing::info!(room_id = %ctx.room().id(), "race time limit reached");
                    end_race(ctx);
                }
            })
            .await;
    }

    /// One pass of the idle-lobby sweep.
    ///
    /// Lobby participants quiet for longer than the idle threshold are
    /// removed. Rooms that are empty and have been quiet just as long are
    /// deleted; rooms the sweep itself emptied get the usual grace period.
    pub(crate) async fn sweep_idle(self: &Arc<Self>) {
        let now = now_ms();
        let threshold = self.config.idle_threshold.as_millis() as u64;

        for handle in self.rooms.list_all().await {
            let room_id = handle.room_id().clone();
            let outcome = handle
                .run(move |ctx| {
                    let departures = ctx.room_mut().prune_idle(now, threshold);
                    let mut pruned = Vec::with_capacity(departures.len());
                    for departure in departures {
                        let session_id = departure.participant.session_id().clone();
                        ctx.broadcast(ServerEvent::PlayerLeft {
                            session_id: session_id.clone(),
                        });
                        ctx.detach(&session_id);
                        if let Some(host) = &departure.new_host {
                            ctx.send_to(
                                host,
                                ServerEvent::HostPromoted {
                                    message: HOST_PROMOTED_MESSAGE.into(),
                                },
                            );
                        }
                        pruned.push(session_id);
                    }
                    if !pruned.is_empty() && !ctx.room().is_empty() {
                        ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
                    }

                    let empty = ctx.room().is_empty();
                    let stale = empty && now.saturating_sub(ctx.room().last_activity()) > threshold;
                    if stale {
                        ctx.close();
                    }
                    (pruned, empty, stale)
                })
                .await;

            let Ok((pruned, empty, stale)) = outcome else {
                continue;
            };
            if !pruned.is_empty() {
                let mut sessions = self.sessions.lock().await;
                for session_id in &pruned {
                    sessions.unbind_participant(&room_id, session_id);
                }
                tracing::info!(%room_id, pruned = pruned.len(), "removed idle participants");
            }
            if stale {
                self.rooms.delete(&room_id).await;
                self.timers.lock().await.cancel_where(|(id, _)| id == &room_id);
            } else if empty && !pruned.is_empty() {
                self.schedule_deletion(room_id).await;
            }
        }
    }

    /// One heartbeat round over every connection.
    pub(crate) async fn heartbeat(&self) {
        let sweep = self.sessions.lock().await.heartbeat_sweep();
        tracing::trace!(pinged = sweep.pinged.len(), "heartbeat");
        if !sweep.terminated.is_empty() {
            tracing::info!(
                terminated = sweep.terminated.len(),
                "terminated connections that missed a heartbeat"
            );
        }
    }
}

impl<A, D, W, S> ServerState<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    /// Moves a room from COUNTDOWN to RACING once the countdown elapses,
    /// and arms the time limit for time-mode races.
    pub(crate) async fn begin_race(self: &Arc<Self>, room_id: &RoomId) {
        let Some(handle) = self.rooms.find_by_id(room_id).await else {
            return;
        };
        let now = now_ms();
        let started = handle
            .run(move |ctx| {
                // The countdown may have been canceled after this timer fired.
                if ctx.room().status() != RoomStatus::Countdown {
                    return None;
                }
                if let Err(e) = ctx.room_mut().start_racing(now) {
                    tracing::debug!(error = %e, "could not start race");
                    return None;
                }
                ctx.broadcast(ServerEvent::RaceStart {});
                Some(ctx.room().config())
            })
            .await;

        if let Ok(Some(RaceConfig::Time { duration_seconds })) = started {
            let state = Arc::clone(self);
            let id = room_id.clone();
            self.timers.lock().await.schedule(
                (room_id.clone(), TimerKind::TimeLimit),
                Duration::from_secs(u64::from(duration_seconds)),
                async move { state.expire_race(&id).await },
            );
        }
    }

    /// Deletes an empty room, after the grace period if one is configured.
    pub(crate) async fn schedule_deletion(self: &Arc<Self>, room_id: RoomId) {
        match self.config.grace_period {
            Some(grace) => {
                let state = Arc::clone(self);
                let id = room_id.clone();
                self.timers.lock().await.schedule(
                    (room_id.clone(), TimerKind::Deletion),
                    grace,
                    async move { state.delete_if_empty(&id).await },
                );
                tracing::info!(%room_id, grace_ms = grace.as_millis() as u64, "room empty, deletion scheduled");
            }
            None => self.delete_if_empty(&room_id).await,
        }
    }
}

/// Force-finishes the race if it is still running and broadcasts the
/// standings.
pub(crate) fn end_race(ctx: &mut RoomContext) {
    if ctx.room().status() == RoomStatus::Racing {
        if let Err(e) = ctx.room_mut().finish_racing() {
            tracing::warn!(error = %e, "could not finish race");
            return;
        }
    }
    let leaderboard = ctx.room().leaderboard();
    ctx.broadcast(ServerEvent::RaceFinished { leaderboard });
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a Keyrace server.
///
/// # Example
///
/// ```rust,no_run
/// use keyrace::prelude::*;
///
/// # async fn start() -> Result<(), KeyraceError> {
/// let server = KeyraceServer::builder()
///     .bind("0.0.0.0:8080")
///     .result_secret("change-me")
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct KeyraceServerBuilder<
    A = GuestOnly,
    D = InMemoryRoomDirectory,
    W = StaticWordSource,
    S = NoopResultStore,
> {
    config: ServerConfig,
    auth: A,
    rooms: D,
    words: W,
    results: S,
}

impl KeyraceServerBuilder {
    /// Creates a new builder with default settings and collaborators.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            auth: GuestOnly,
            rooms: InMemoryRoomDirectory::new(),
            words: StaticWordSource::default(),
            results: NoopResultStore,
        }
    }
}

impl Default for KeyraceServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, D, W, S> KeyraceServerBuilder<A, D, W, S> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind = addr.to_string();
        self
    }

    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.config.countdown = countdown;
        self
    }

    /// `None` deletes empty rooms immediately.
    pub fn grace_period(mut self, grace: Option<Duration>) -> Self {
        self.config.grace_period = grace;
        self
    }

    /// Time limit for a new socket's WebSocket upgrade.
    pub fn handshake_timeout(mut self, limit: Duration) -> Self {
        self.config.handshake_timeout = limit;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Enables result digest checks with this shared secret.
    pub fn result_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.result_secret = Some(secret.into());
        self
    }

    pub fn authenticator<A2: Authenticator>(self, auth: A2) -> KeyraceServerBuilder<A2, D, W, S> {
        KeyraceServerBuilder {
            config: self.config,
            auth,
            rooms: self.rooms,
            words: self.words,
            results: self.results,
        }
    }

    pub fn directory<D2: RoomDirectory>(self, rooms: D2) -> KeyraceServerBuilder<A, D2, W, S> {
        KeyraceServerBuilder {
            config: self.config,
            auth: self.auth,
            rooms,
            words: self.words,
            results: self.results,
        }
    }

    pub fn words<W2: WordSource>(self, words: W2) -> KeyraceServerBuilder<A, D, W2, S> {
        KeyraceServerBuilder {
            config: self.config,
            auth: self.auth,
            rooms: self.rooms,
            words,
            results: self.results,
        }
    }

    pub fn results<S2: ResultStore>(self, results: S2) -> KeyraceServerBuilder<A, D, W, S2> {
        KeyraceServerBuilder {
            config: self.config,
            auth: self.auth,
            rooms: self.rooms,
            words: self.words,
            results,
        }
    }
}

impl<A, D, W, S> KeyraceServerBuilder<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    /// Binds the listener and assembles the server.
    pub async fn build(self) -> Result<KeyraceServer<A, D, W, S>, KeyraceError> {
        let transport = WebSocketTransport::bind(&self.config.bind).await?;

        let state = Arc::new(ServerState {
            config: self.config,
            sessions: Mutex::new(SessionRegistry::new()),
            rooms: self.rooms,
            timers: Mutex::new(TimerSet::new()),
            auth: self.auth,
            words: self.words,
            results: self.results,
            codec: JsonCodec,
        });

        Ok(KeyraceServer { transport, state })
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A Keyrace race server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct KeyraceServer<
    A = GuestOnly,
    D = InMemoryRoomDirectory,
    W = StaticWordSource,
    S = NoopResultStore,
> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, D, W, S>>,
}

impl KeyraceServer {
    /// Creates a new builder.
    pub fn builder() -> KeyraceServerBuilder {
        KeyraceServerBuilder::new()
    }
}

impl<A, D, W, S> KeyraceServer<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// A cloneable handle for managing rooms while the server runs.
    pub fn handle(&self) -> ServerHandle<A, D, W, S> {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Creates a room, as `CREATE_ROOM` does.
    pub async fn create_room(
        &self,
        config: Option<RaceConfig>,
        preset_id: Option<String>,
    ) -> Result<RoomId, KeyraceError> {
        self.state.create_room(config, preset_id).await
    }

    /// Runs the server: starts the heartbeat and idle sweep, then accepts
    /// connections and spawns a handler task for each. Runs until the
    /// process is terminated.
    pub async fn run(mut self) -> Result<(), KeyraceError> {
        tracing::info!(
            heartbeat_ms = self.state.config.heartbeat_interval.as_millis() as u64,
            grace_ms = self.state.config.grace_period.map(|g| g.as_millis() as u64),
            "keyrace server running"
        );

        let heartbeat_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = Ticker::new(TickerConfig::every(heartbeat_state.config.heartbeat_interval));
            loop {
                ticker.tick().await;
                heartbeat_state.heartbeat().await;
            }
        });

        let sweep_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = Ticker::new(TickerConfig::every(sweep_state.config.sweep_interval));
            loop {
                ticker.tick().await;
                sweep_state.sweep_idle().await;
            }
        });

        loop {
            match self.transport.accept().await {
                Ok(pending) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let addr = pending.peer_addr();
                        let limit = state.config.handshake_timeout;
                        match tokio::time::timeout(limit, pending.upgrade()).await {
                            Ok(Ok(conn)) => handle_connection(conn, state).await,
                            Ok(Err(e)) => tracing::debug!(%addr, error = %e, "handshake failed"),
                            Err(_) => tracing::warn!(
                                %addr,
                                timeout_ms = limit.as_millis() as u64,
                                "handshake timed out"
                            ),
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Cloneable access to a server's rooms, usable after
/// [`KeyraceServer::run`] has taken the server.
pub struct ServerHandle<A, D, W, S> {
    state: Arc<ServerState<A, D, W, S>>,
}

impl<A, D, W, S> Clone for ServerHandle<A, D, W, S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A, D, W, S> ServerHandle<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    /// Creates a room, as `CREATE_ROOM` does.
    pub async fn create_room(
        &self,
        config: Option<RaceConfig>,
        preset_id: Option<String>,
    ) -> Result<RoomId, KeyraceError> {
        self.state.create_room(config, preset_id).await
    }

    /// Current state of a room, or `None` if it doesn't exist.
    pub async fn room_snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        let handle = self.state.rooms.find_by_id(room_id).await?;
        handle.run(|ctx| ctx.room().snapshot()).await.ok()
    }

    /// Number of rooms in the directory.
    pub async fn room_count(&self) -> usize {
        self.state.rooms.list_all().await.len()
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.state.sessions.lock().await.len()
    }

    /// Runs the idle-lobby sweep now instead of waiting for its interval.
    pub async fn sweep_idle(&self) {
        self.state.sweep_idle().await;
    }
}
