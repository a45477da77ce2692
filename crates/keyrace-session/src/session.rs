//! Per-connection session state.
//!
//! A session lives exactly as long as its transport connection. It holds
//! the outbound queue other tasks use to reach the client, the liveness
//! flag the heartbeat flips, and, once the client has joined a room, its
//! [`Membership`].

use std::sync::Arc;

use keyrace_protocol::{RoomId, ServerEvent, SessionId, UserId};
use keyrace_transport::ConnectionId;
use tokio::sync::{Notify, mpsc};

/// Something queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An event to encode and send.
    Event(ServerEvent),
    /// A transport-level liveness probe.
    Ping,
}

/// Queue into a connection's writer task.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Queues `event` for a connection. Returns `false` if the writer is gone.
pub fn deliver(sender: &OutboundSender, event: ServerEvent) -> bool {
    sender.send(Outbound::Event(event)).is_ok()
}

/// Which room a connection is racing in, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub username: String,
    /// Present only when the join credential was accepted.
    pub user_id: Option<UserId>,
}

/// The server's record of one live connection.
#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub outbound: OutboundSender,
    /// Fired to make the connection's reader stop.
    pub terminate: Arc<Notify>,
    pub membership: Option<Membership>,
    /// Cleared before each heartbeat ping, set again by the pong.
    pub alive: bool,
}

impl Session {
    /// Creates a fresh, room-less session.
    pub fn new(connection_id: ConnectionId, outbound: OutboundSender) -> Self {
        Self {
            connection_id,
            outbound,
            terminate: Arc::new(Notify::new()),
            membership: None,
            alive: true,
        }
    }

    /// Queues an event for this connection.
    pub fn send(&self, event: ServerEvent) -> bool {
        deliver(&self.outbound, event)
    }

    /// `true` if this connection already races in `room_id` as `username`.
    pub fn is_member_as(&self, room_id: &RoomId, username: &str) -> bool {
        self.membership
            .as_ref()
            .is_some_and(|m| &m.room_id == room_id && m.username == username)
    }
}
