//! Room actor: an isolated Tokio task that owns one [`Room`].
//!
//! Each room runs in its own task and is reached only through its
//! channel. A command is a closure that gets exclusive access to the room
//! and its members' outbound queues; it runs to completion before the
//! next one starts, so a mutation and the broadcast describing it can
//! never interleave with another handler's work on the same room.

use std::collections::HashMap;

use keyrace_protocol::{RoomId, ServerEvent, SessionId};
use keyrace_session::{OutboundSender, deliver};
use tokio::sync::{mpsc, oneshot};

use crate::{Departure, Room, RoomError};

/// Default command channel size for room actors.
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Who an event goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    Participant(SessionId),
    AllExcept(SessionId),
}

type Job = Box<dyn FnOnce(&mut RoomContext) + Send>;

/// Commands sent to a room actor through its channel.
enum RoomCommand {
    /// Run a closure against the room.
    Run(Job),
    /// Stop the actor.
    Shutdown,
}

/// What a command closure gets: the room plus a way to reach its members.
pub struct RoomContext {
    room: Room,
    members: HashMap<SessionId, OutboundSender>,
    closed: bool,
}

impl RoomContext {
    fn new(room: Room) -> Self {
        Self {
            room,
            members: HashMap::new(),
            closed: false,
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn room_mut(&mut self) -> &mut Room {
        &mut self.room
    }

    /// Registers the outbound queue for a participant.
    pub fn attach(&mut self, session_id: SessionId, sender: OutboundSender) {
        self.members.insert(session_id, sender);
    }

    /// Forgets a participant's outbound queue.
    pub fn detach(&mut self, session_id: &SessionId) {
        self.members.remove(session_id);
    }

    /// Removes a participant from the room and stops delivering to them.
    pub fn remove_member(&mut self, session_id: &SessionId) -> Option<Departure> {
        self.detach(session_id);
        self.room.remove_participant(session_id)
    }

    /// Fails with [`RoomError::NotHost`] unless `session_id` is the host.
    pub fn require_host(&self, session_id: &SessionId, action: &'static str) -> Result<(), RoomError> {
        if self.room.is_host(session_id) {
            Ok(())
        } else {
            Err(RoomError::NotHost(action))
        }
    }

    /// Sends an event to one member. Silently drops if their writer is
    /// gone; the connection's own cleanup will remove them.
    pub fn send_to(&self, session_id: &SessionId, event: ServerEvent) {
        if let Some(sender) = self.members.get(session_id) {
            deliver(sender, event);
        }
    }

    pub fn broadcast(&self, event: ServerEvent) {
        self.dispatch(Recipient::All, event);
    }

    /// Delivers an event to the chosen recipients.
    pub fn dispatch(&self, recipient: Recipient, event: ServerEvent) {
        match recipient {
            Recipient::All => {
                for sender in self.members.values() {
                    deliver(sender, event.clone());
                }
            }
            Recipient::Participant(id) => self.send_to(&id, event),
            Recipient::AllExcept(excluded) => {
                for (id, sender) in &self.members {
                    if *id != excluded {
                        deliver(sender, event.clone());
                    }
                }
            }
        }
    }

    /// Stops the actor once the current command returns. Later commands
    /// fail with [`RoomError::Unavailable`].
    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Handle to a running room actor.
///
/// Cheap to clone; it's just an `mpsc::Sender` and the room's id.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomCommand>,
}

impl std::fmt::Debug for RoomCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run(_) => f.write_str("Run"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// `true` once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Runs `f` inside the actor and returns its result.
    ///
    /// # Errors
    /// [`RoomError::Unavailable`] if the actor has stopped.
    pub async fn run<R, F>(&self, f: F) -> Result<R, RoomError>
    where
        R: Send + 'static,
        F: FnOnce(&mut RoomContext) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        });
        self.sender
            .send(RoomCommand::Run(job))
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Like [`run`](Self::run) for closures that can fail with a room error.
    pub async fn try_run<T, F>(&self, f: F) -> Result<T, RoomError>
    where
        T: Send + 'static,
        F: FnOnce(&mut RoomContext) -> Result<T, RoomError> + Send + 'static,
    {
        self.run(f).await?
    }

    /// Tells the room to shut down.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }
}

struct RoomActor {
    ctx: RoomContext,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl RoomActor {
    async fn run(mut self) {
        let room_id = self.ctx.room.id().clone();
        tracing::info!(%room_id, "room actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Run(job) => {
                    job(&mut self.ctx);
                    if self.ctx.closed {
                        break;
                    }
                }
                RoomCommand::Shutdown => {
                    tracing::info!(%room_id, "room shutting down");
                    break;
                }
            }
        }

        tracing::info!(%room_id, "room actor stopped");
    }
}

/// Spawns an actor for `room` and returns a handle to it.
pub fn spawn_room(room: Room) -> RoomHandle {
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
    let room_id = room.id().clone();
    let actor = RoomActor {
        ctx: RoomContext::new(room),
        receiver: rx,
    };
    tokio::spawn(actor.run());
    RoomHandle {
        room_id,
        sender: tx,
    }
}
