//! Per-connection handler: session registration, the write pump, and
//! event routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Register a session with an outbound queue, start the writer task
//!   2. Loop: receive frames → pongs mark the session alive, data frames
//!      are decoded and dispatched to the matching event handler
//!   3. On close or heartbeat termination, leave the room (if any) and
//!      drop the session

use std::sync::Arc;

use keyrace_protocol::{
    ClientEvent, Codec, CreateRoom, Envelope, JoinRoom, JsonCodec, RaceConfig, RoomId, RoomStatus,
    ServerEvent, SessionId, SubmitResult,
};
use keyrace_room::{Recipient, RoomContext, RoomDirectory, RoomError, RoomHandle};
use keyrace_session::{
    Authenticator, Membership, Outbound, SessionError, generate_session_id,
};
use keyrace_stats::SignedFields;
use keyrace_transport::{Connection, ConnectionId, Frame, WebSocketConnection};
use tokio::sync::{Notify, mpsc};

use crate::server::{HOST_PROMOTED_MESSAGE, ServerState, TimerKind, end_race, now_ms};
use crate::{KeyraceError, ResultRecord, ResultStore, WordSource};

/// Drop guard that releases a connection's session when the handler exits.
///
/// Cleanup runs even if the handler panics. Since `Drop` is synchronous,
/// we spawn a fire-and-forget task for the async part.
struct SessionGuard<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    connection_id: ConnectionId,
    state: Arc<ServerState<A, D, W, S>>,
}

impl<A, D, W, S> Drop for SessionGuard<A, D, W, S>
where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move { state.disconnect(connection_id).await });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, D, W, S>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, D, W, S>>,
) where
    A: Authenticator,
    D: RoomDirectory,
    W: WordSource,
    S: ResultStore,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let (outbound, queue) = mpsc::unbounded_channel();
    let terminate = {
        let mut sessions = state.sessions.lock().await;
        sessions.register(conn_id, outbound);
        sessions.get(conn_id).map(|s| Arc::clone(&s.terminate))
    };
    let Some(terminate) = terminate else {
        return;
    };
    let _guard = SessionGuard {
        connection_id: conn_id,
        state: Arc::clone(&state),
    };

    let writer = tokio::spawn(write_pump(
        Arc::clone(&conn),
        queue,
        Arc::clone(&terminate),
        state.codec,
    ));

    loop {
        let frame = tokio::select! {
            biased;
            _ = terminate.notified() => {
                tracing::info!(%conn_id, "terminating connection");
                break;
            }
            frame = conn.recv() => frame,
        };

        match frame {
            Ok(Some(Frame::Pong)) => state.sessions.lock().await.mark_alive(conn_id),
            Ok(Some(Frame::Data(data))) => state.handle_frame(conn_id, &data).await,
            Ok(None) => {
                tracing::info!(%conn_id, "connection closed cleanly");
                break;
            }
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                break;
            }
        }
    }

    writer.abort();
    let _ = conn.close().await;
    // _guard drops here → session cleanup fires.
}

/// Drains a connection's outbound queue onto the socket.
///
/// A failed send means the peer is gone; the reader is told to stop so
/// the session gets cleaned up.
async fn write_pump(
    conn: Arc<WebSocketConnection>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    terminate: Arc<Notify>,
    codec: JsonCodec,
) {
    while let Some(item) = queue.recv().await {
        let sent = match item {
            Outbound::Event(event) => match codec.encode(&event) {
                Ok(bytes) => conn.send(&bytes).await,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), error = %e, "failed to encode event");
                    continue;
                }
            },
            Outbound::Ping => conn.ping().await,
        };
        if let Err(e) = sent {
            tracing::debug!(conn_id = %conn.id(), error = %e, "send failed");
            terminate.notify_one();
            break;
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
    /// Decodes one data frame and runs it.
    ///
    /// Malformed frames are logged and dropped; unknown event types are
    /// ignored. A rejected request gets an `ERROR` reply.
    async fn handle_frame(self: &Arc<Self>, conn_id: ConnectionId, data: &[u8]) {
        let envelope: Envelope = match self.codec.decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                return;
            }
        };
        let kind = envelope.kind.clone();
        let event = match ClientEvent::from_envelope(envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(%conn_id, event = %kind, "ignoring unknown event type");
                return;
            }
            Err(e) => {
                tracing::debug!(%conn_id, event = %kind, error = %e, "malformed payload");
                return;
            }
        };

        let kind = event.kind();
        if let Err(e) = self.dispatch(conn_id, event).await {
            tracing::debug!(%conn_id, event = kind, error = %e, "request rejected");
            self.send_to_connection(conn_id, ServerEvent::error(e.to_string())).await;
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), KeyraceError> {
        match event {
            ClientEvent::CreateRoom(payload) => self.handle_create_room(conn_id, payload).await,
            ClientEvent::JoinRoom(payload) => self.handle_join_room(conn_id, payload).await,
            ClientEvent::StartRace => self.handle_start_race(conn_id).await,
            ClientEvent::UpdateProgress(payload) => {
                self.handle_update_progress(conn_id, payload.typed_length).await
            }
            ClientEvent::UpdateSettings(payload) => {
                self.handle_update_settings(conn_id, payload.config).await
            }
            ClientEvent::TransferHost(payload) => {
                self.handle_transfer_host(conn_id, payload.target_id).await
            }
            ClientEvent::LoadMoreWords => self.handle_load_more_words(conn_id).await,
            ClientEvent::SubmitResult(payload) => self.handle_submit_result(conn_id, *payload).await,
            ClientEvent::LeaveRoom => {
                self.leave_room(conn_id).await;
                Ok(())
            }
            ClientEvent::RestartGame => self.handle_restart_game(conn_id).await,
        }
    }

    // -- helpers ------------------------------------------------------------

    async fn send_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) {
        if let Some(session) = self.sessions.lock().await.get(conn_id) {
            session.send(event);
        }
    }

    async fn membership(&self, conn_id: ConnectionId) -> Result<Membership, KeyraceError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.membership(conn_id)?.clone())
    }

    /// Runs `f` in the caller's room on behalf of their participant,
    /// refreshing their activity stamp first.
    async fn in_room<T, F>(&self, conn_id: ConnectionId, f: F) -> Result<(Membership, T), KeyraceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut RoomContext, &SessionId) -> Result<T, KeyraceError> + Send + 'static,
    {
        let membership = self.membership(conn_id).await?;
        let handle = self.room_handle(&membership).await?;
        let session_id = membership.session_id.clone();
        let now = now_ms();
        let out = handle
            .run(move |ctx| {
                ctx.room_mut().touch(&session_id, now);
                f(ctx, &session_id)
            })
            .await??;
        Ok((membership, out))
    }

    async fn room_handle(&self, membership: &Membership) -> Result<RoomHandle, KeyraceError> {
        self.rooms
            .find_by_id(&membership.room_id)
            .await
            .ok_or_else(|| RoomError::NotFound(membership.room_id.clone()).into())
    }

    async fn cancel_race_timers(&self, membership: &Membership) {
        let mut timers = self.timers.lock().await;
        timers.cancel(&(membership.room_id.clone(), TimerKind::Countdown));
        timers.cancel(&(membership.room_id.clone(), TimerKind::TimeLimit));
    }

    // -- room lifecycle -----------------------------------------------------

    async fn handle_create_room(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        payload: CreateRoom,
    ) -> Result<(), KeyraceError> {
        let room_id = self.create_room(payload.config, payload.preset_id).await?;
        self.send_to_connection(conn_id, ServerEvent::RoomCreated { room_id }).await;
        Ok(())
    }

    async fn handle_join_room(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        payload: JoinRoom,
    ) -> Result<(), KeyraceError> {
        let room_id = RoomId::normalized(&payload.room_id);
        let username = payload.username.trim().to_string();
        if username.is_empty() {
            return Err(KeyraceError::BadRequest("Username is required".into()));
        }

        let (current, rejoining, outbound) = {
            let sessions = self.sessions.lock().await;
            let session = sessions.get(conn_id).ok_or(SessionError::NotFound(conn_id))?;
            (
                session.membership.clone(),
                session.is_member_as(&room_id, &username),
                session.outbound.clone(),
            )
        };
        if let Some(current) = current {
            // Same room under the same name: a reconnecting client that
            // only needs the current state again.
            if rejoining {
                let handle = self.room_handle(&current).await?;
                let room = handle.run(|ctx| ctx.room().snapshot()).await?;
                self.send_to_connection(
                    conn_id,
                    ServerEvent::RoomState {
                        session_id: current.session_id,
                        room,
                    },
                )
                .await;
                return Ok(());
            }
            self.leave_room(conn_id).await;
        }

        self.timers
            .lock()
            .await
            .cancel(&(room_id.clone(), TimerKind::Deletion));
        let handle = self
            .rooms
            .find_by_id(&room_id)
            .await
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        let user_id = match payload.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => match self.auth.authenticate(token).await {
                Ok(user_id) => Some(user_id),
                Err(e) => {
                    tracing::warn!(%conn_id, error = %e, "credential rejected, joining as guest");
                    None
                }
            },
            None => None,
        };

        let session_id = generate_session_id();
        let now = now_ms();
        let joined = {
            let session_id = session_id.clone();
            let username = username.clone();
            let user_id = user_id.clone();
            handle
                .try_run(move |ctx| {
                    let participant = ctx
                        .room_mut()
                        .add_participant(session_id.clone(), username, user_id, now)?
                        .view();
                    ctx.attach(session_id.clone(), outbound);
                    let room = ctx.room().snapshot();
                    ctx.send_to(
                        &session_id,
                        ServerEvent::RoomState {
                            session_id: session_id.clone(),
                            room,
                        },
                    );
                    ctx.dispatch(
                        Recipient::AllExcept(session_id),
                        ServerEvent::PlayerJoined { participant },
                    );
                    Ok(())
                })
                .await
        };
        if let Err(e) = joined {
            // The join canceled a pending deletion; put it back.
            self.retire_if_empty(&handle).await;
            return Err(match e {
                RoomError::Unavailable(id) => RoomError::NotFound(id),
                other => other,
            }
            .into());
        }

        tracing::info!(%conn_id, %room_id, %session_id, %username, "joined room");
        let membership = Membership {
            room_id,
            session_id,
            username,
            user_id,
        };
        let bound = self.sessions.lock().await.bind(conn_id, membership.clone());
        if bound.is_err() {
            // The connection went away mid-join.
            self.release(membership).await;
        }
        Ok(())
    }

    /// LEAVE_ROOM, and switching rooms: leave but keep the connection.
    async fn leave_room(self: &Arc<Self>, conn_id: ConnectionId) {
        let membership = self.sessions.lock().await.unbind(conn_id);
        if let Some(membership) = membership {
            tracing::info!(%conn_id, room_id = %membership.room_id, "left room");
            self.release(membership).await;
        }
    }

    /// Connection closed or terminated: drop the session and leave its room.
    pub(crate) async fn disconnect(self: &Arc<Self>, conn_id: ConnectionId) {
        let session = self.sessions.lock().await.remove(conn_id);
        if let Some(membership) = session.and_then(|s| s.membership) {
            tracing::info!(%conn_id, room_id = %membership.room_id, "disconnected from room");
            self.release(membership).await;
        }
    }

    /// Removes a participant from their room, tells everyone else, and
    /// schedules the room for deletion if nobody is left.
    async fn release(self: &Arc<Self>, membership: Membership) {
        let Ok(handle) = self.room_handle(&membership).await else {
            return;
        };
        let session_id = membership.session_id.clone();
        let emptied = handle
            .run(move |ctx| {
                let Some(departure) = ctx.remove_member(&session_id) else {
                    return false;
                };
                ctx.broadcast(ServerEvent::PlayerLeft { session_id });
                if let Some(host) = &departure.new_host {
                    ctx.send_to(
                        host,
                        ServerEvent::HostPromoted {
                            message: HOST_PROMOTED_MESSAGE.into(),
                        },
                    );
                    ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
                }
                stop_if_empty(ctx)
            })
            .await;

        if let Ok(true) = emptied {
            self.cancel_race_timers(&membership).await;
            self.schedule_deletion(membership.room_id).await;
        }
    }

    /// Reschedules deletion for a room that's still empty.
    async fn retire_if_empty(self: &Arc<Self>, handle: &RoomHandle) {
        let empty = handle.run(stop_if_empty).await;
        if let Ok(true) = empty {
            self.schedule_deletion(handle.room_id().clone()).await;
        }
    }

    // -- race flow ----------------------------------------------------------

    async fn handle_start_race(self: &Arc<Self>, conn_id: ConnectionId) -> Result<(), KeyraceError> {
        let now = now_ms();
        let (membership, ()) = self
            .in_room(conn_id, move |ctx, session_id| {
                ctx.require_host(session_id, "start the race")?;
                ctx.room_mut().start_race()?;
                ctx.broadcast(ServerEvent::CountdownStart { start_time: now });
                Ok(())
            })
            .await?;

        tracing::info!(room_id = %membership.room_id, "countdown started");
        let state = Arc::clone(self);
        let room_id = membership.room_id.clone();
        self.timers.lock().await.schedule(
            (membership.room_id, TimerKind::Countdown),
            self.config.countdown,
            async move { state.begin_race(&room_id).await },
        );
        Ok(())
    }

    async fn handle_update_progress(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        typed_length: usize,
    ) -> Result<(), KeyraceError> {
        let now = now_ms();
        let (membership, ended) = self
            .in_room(conn_id, move |ctx, session_id| {
                if ctx.room().status() != RoomStatus::Racing {
                    return Ok(false);
                }
                let outcome = ctx
                    .room_mut()
                    .update_participant_progress(session_id, typed_length, now)?;
                ctx.broadcast(ServerEvent::ProgressUpdate {
                    participants: ctx.room().participant_views(),
                });
                // The first finisher ends the race for everyone.
                if outcome.participant_finished || outcome.race_finished {
                    end_race(ctx);
                    return Ok(true);
                }
                Ok(false)
            })
            .await?;

        if ended {
            tracing::info!(room_id = %membership.room_id, "race finished");
            self.timers
                .lock()
                .await
                .cancel(&(membership.room_id, TimerKind::TimeLimit));
        }
        Ok(())
    }

    async fn handle_submit_result(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        submission: SubmitResult,
    ) -> Result<(), KeyraceError> {
        let secret = self.config.result_secret.clone();
        let tolerance = self.config.tolerance;
        let now = now_ms();

        let verified = self
            .in_room(conn_id, move |ctx, session_id| {
                let target_text = ctx.room().joined_text();
                if let Some(secret) = secret.as_deref() {
                    SignedFields::from_submission(&submission, &target_text)
                        .verify(secret, &submission.hash)?;
                }
                let stats = ctx
                    .room()
                    .get_participant_final_stats(session_id, &submission.replay_data, now)
                    .ok_or(RoomError::RaceNotStarted)?;
                if let Some(tolerance) = tolerance {
                    tolerance.check(submission.wpm, submission.accuracy, &stats)?;
                }
                ctx.room_mut().apply_final_stats(session_id, &stats)?;
                ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
                let preset_id = ctx.room().preset_id().map(str::to_owned);
                Ok((stats, target_text, preset_id, submission))
            })
            .await;

        let (membership, (stats, target_text, preset_id, submission)) = match verified {
            Ok(verified) => verified,
            Err(e @ KeyraceError::Verify(_)) => {
                tracing::warn!(%conn_id, error = %e, "result failed verification");
                self.send_to_connection(conn_id, ServerEvent::ResultSaved { success: false })
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Guests race without a record.
        if membership.user_id.is_none() {
            return Ok(());
        }
        let record = ResultRecord {
            user_id: membership.user_id,
            preset_id,
            wpm: stats.wpm,
            raw: stats.raw,
            net_wpm: stats.net_wpm,
            accuracy: stats.accuracy,
            consistency: submission.consistency,
            afk_duration: submission.afk_duration,
            replay_data: submission.replay_data,
            target_text,
            hash: submission.hash,
        };
        let success = match self.results.save_result(record).await {
            Ok(stored) => stored.is_some(),
            Err(e) => {
                tracing::warn!(%conn_id, error = %e, "failed to save result");
                false
            }
        };
        self.send_to_connection(conn_id, ServerEvent::ResultSaved { success })
            .await;
        Ok(())
    }

    // -- room settings ------------------------------------------------------

    async fn handle_update_settings(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        config: RaceConfig,
    ) -> Result<(), KeyraceError> {
        self.in_room(conn_id, |ctx, session_id| {
            ctx.require_host(session_id, "change settings")?;
            Ok(())
        })
        .await?;
        if !config.is_valid() {
            return Err(RoomError::InvalidConfig.into());
        }
        let text = self.fetch_text(&config).await;
        self.in_room(conn_id, move |ctx, session_id| {
            ctx.require_host(session_id, "change settings")?;
            ctx.room_mut().update_config(config, text)?;
            ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn handle_transfer_host(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        target: SessionId,
    ) -> Result<(), KeyraceError> {
        self.in_room(conn_id, move |ctx, session_id| {
            ctx.require_host(session_id, "transfer host")?;
            if !ctx.room_mut().transfer_host(&target) {
                return Err(RoomError::ParticipantNotFound(target).into());
            }
            ctx.send_to(
                &target,
                ServerEvent::HostPromoted {
                    message: HOST_PROMOTED_MESSAGE.into(),
                },
            );
            ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn handle_load_more_words(self: &Arc<Self>, conn_id: ConnectionId) -> Result<(), KeyraceError> {
        self.membership(conn_id).await?;
        let words = self.words.get_words(self.config.load_more_batch).await;
        self.in_room(conn_id, move |ctx, _| {
            ctx.room_mut().append_words(words.iter().cloned());
            ctx.broadcast(ServerEvent::WordsAppended { words });
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn handle_restart_game(self: &Arc<Self>, conn_id: ConnectionId) -> Result<(), KeyraceError> {
        // Checked before fetching so non-hosts don't cost a word fetch.
        let (_, config) = self
            .in_room(conn_id, |ctx, session_id| {
                ctx.require_host(session_id, "restart the race")?;
                Ok(ctx.room().config())
            })
            .await?;
        let text = self.fetch_text(&config).await;

        let (membership, ()) = self
            .in_room(conn_id, move |ctx, session_id| {
                ctx.require_host(session_id, "restart the race")?;
                ctx.room_mut().restart(text)?;
                ctx.broadcast(ServerEvent::RoomUpdate(ctx.room().snapshot()));
                Ok(())
            })
            .await?;
        self.cancel_race_timers(&membership).await;
        tracing::info!(room_id = %membership.room_id, "race restarted");
        Ok(())
    }
}

/// Returns `true` if the room has nobody left, stopping any countdown or
/// race that was running.
fn stop_if_empty(ctx: &mut RoomContext) -> bool {
    if !ctx.room().is_empty() {
        return false;
    }
    let room = ctx.room_mut();
    let stopped = match room.status() {
        RoomStatus::Countdown => room.cancel_countdown(),
        RoomStatus::Racing => room.finish_racing(),
        RoomStatus::Lobby | RoomStatus::Finished => Ok(()),
    };
    if let Err(e) = stopped {
        tracing::debug!(room_id = %room.id(), error = %e, "could not stop empty room");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrace_protocol::Timestamp;
    use keyrace_room::{Room, spawn_room};

    fn room_with(ids: &[&str]) -> Room {
        let mut room = Room::new(
            RoomId("HND001".into()),
            RaceConfig::Words { word_count: 1 },
            vec!["go".into()],
            None,
            0,
        );
        for id in ids {
            room.add_participant(SessionId((*id).into()), *id, None, 0).unwrap();
        }
        room
    }

    #[tokio::test]
    async fn test_stop_if_empty_keeps_populated_room() {
        let handle = spawn_room(room_with(&["a"]));
        assert!(!handle.run(stop_if_empty).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_if_empty_cancels_countdown() {
        let mut room = room_with(&["a"]);
        room.start_race().unwrap();
        room.remove_participant(&SessionId("a".into()));
        let handle = spawn_room(room);

        assert!(handle.run(stop_if_empty).await.unwrap());
        let status = handle.run(|ctx| ctx.room().status()).await.unwrap();
        assert_eq!(status, RoomStatus::Lobby);
    }

    #[tokio::test]
    async fn test_stop_if_empty_finishes_abandoned_race() {
        let mut room = room_with(&["a"]);
        room.start_race().unwrap();
        room.start_racing(1).unwrap();
        room.remove_participant(&SessionId("a".into()));
        let handle = spawn_room(room);

        assert!(handle.run(stop_if_empty).await.unwrap());
        let status = handle.run(|ctx| ctx.room().status()).await.unwrap();
        assert_eq!(status, RoomStatus::Finished);
    }

    #[test]
    fn test_now_ms_is_after_2020() {
        let now: Timestamp = now_ms();
        assert!(now > 1_577_836_800_000);
    }
}
