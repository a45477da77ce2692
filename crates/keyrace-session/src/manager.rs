//! The session registry: every live connection and what it's bound to.
//!
//! # Concurrency note
//!
//! `SessionRegistry` is a plain map. The server wraps it in a mutex and
//! never holds that lock across an `.await`.

use std::collections::HashMap;

use keyrace_protocol::{RoomId, SessionId};
use keyrace_transport::ConnectionId;
use rand::Rng;

use crate::{Membership, Outbound, OutboundSender, Session, SessionError};

/// What a heartbeat sweep did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeartbeatSweep {
    /// Connections that were probed this round.
    pub pinged: Vec<ConnectionId>,
    /// Connections that never answered the previous probe and were told
    /// to terminate.
    pub terminated: Vec<ConnectionId>,
}

/// Tracks all live connections.
///
/// ```text
/// register() ──→ bind() ──→ unbind() ──→ remove()
///     │            │                        ▲
///     └── heartbeat_sweep() ── no pong ─────┘ (terminate)
/// ```
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly accepted connection.
    pub fn register(&mut self, connection_id: ConnectionId, outbound: OutboundSender) {
        tracing::debug!(%connection_id, "session registered");
        self.sessions
            .insert(connection_id, Session::new(connection_id, outbound));
    }

    /// Forgets a connection, returning its last state.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let removed = self.sessions.remove(&connection_id);
        if removed.is_some() {
            tracing::debug!(%connection_id, "session removed");
        }
        removed
    }

    /// Looks up a session.
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    /// Returns the room membership of a connection.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] — unknown connection
    /// - [`SessionError::NotInRoom`] — hasn't joined a room
    pub fn membership(&self, connection_id: ConnectionId) -> Result<&Membership, SessionError> {
        self.sessions
            .get(&connection_id)
            .ok_or(SessionError::NotFound(connection_id))?
            .membership
            .as_ref()
            .ok_or(SessionError::NotInRoom(connection_id))
    }

    /// Records that a connection joined a room.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] for an unknown connection.
    pub fn bind(
        &mut self,
        connection_id: ConnectionId,
        membership: Membership,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(SessionError::NotFound(connection_id))?;
        session.membership = Some(membership);
        Ok(())
    }

    /// Clears a connection's room membership and returns it.
    pub fn unbind(&mut self, connection_id: ConnectionId) -> Option<Membership> {
        self.sessions
            .get_mut(&connection_id)
            .and_then(|s| s.membership.take())
    }

    /// Clears the membership of whichever connection holds `session_id`
    /// in `room_id`, e.g. after the room evicted it. Returns that
    /// connection.
    pub fn unbind_participant(
        &mut self,
        room_id: &RoomId,
        session_id: &SessionId,
    ) -> Option<ConnectionId> {
        let session = self.sessions.values_mut().find(|s| {
            s.membership
                .as_ref()
                .is_some_and(|m| &m.room_id == room_id && &m.session_id == session_id)
        })?;
        session.membership = None;
        Some(session.connection_id)
    }

    /// Marks a connection as having answered the last probe.
    pub fn mark_alive(&mut self, connection_id: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.alive = true;
        }
    }

    /// One heartbeat round.
    ///
    /// Connections that answered the previous probe get a new one and
    /// are marked pending. Connections still pending from last round are
    /// told to terminate; their reader tasks then run the normal
    /// disconnect cleanup. A connection whose writer is already gone is
    /// terminated too.
    pub fn heartbeat_sweep(&mut self) -> HeartbeatSweep {
        let mut sweep = HeartbeatSweep::default();
        for session in self.sessions.values_mut() {
            if session.alive && session.outbound.send(Outbound::Ping).is_ok() {
                session.alive = false;
                sweep.pinged.push(session.connection_id);
            } else {
                tracing::warn!(
                    connection_id = %session.connection_id,
                    "no heartbeat response, terminating"
                );
                session.terminate.notify_one();
                sweep.terminated.push(session.connection_id);
            }
        }
        sweep
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` if nothing is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Generates a random 16-character hex participant id (64 bits).
pub fn generate_session_id() -> SessionId {
    let bytes: [u8; 8] = rand::rng().random();
    SessionId(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

// =========================================================================
// Tests
// =========================================================================
