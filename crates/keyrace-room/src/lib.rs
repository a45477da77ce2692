//! Race rooms for Keyrace.
//!
//! Each room runs as an isolated Tokio task (actor model) that owns the
//! [`Room`] aggregate and the outbound queues of its participants.
//!
//! # Key types
//!
//! - [`Room`] — the race state machine and its participants
//! - [`Participant`] / [`RaceStats`] — one racer's identity and figures
//! - [`RaceStrategy`] — progress and finish rules per race mode
//! - [`RoomHandle`] — run commands on a room actor
//! - [`RoomDirectory`] — keyed storage of live rooms

#![allow(async_fn_in_trait)]

mod actor;
mod directory;
mod error;
mod participant;
mod room;
mod strategy;

pub use actor::{Recipient, RoomContext, RoomHandle, spawn_room};
pub use directory::{InMemoryRoomDirectory, ROOM_ID_LEN, RoomDirectory, generate_room_id};
pub use error::RoomError;
pub use participant::{Participant, RaceStats};
pub use room::{Departure, ProgressOutcome, Room};
pub use strategy::RaceStrategy;
