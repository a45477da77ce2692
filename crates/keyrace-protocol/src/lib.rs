//! Wire protocol for Keyrace.
//!
//! This crate defines the vocabulary every other layer shares:
//!
//! - **Types** ([`RoomId`], [`SessionId`], [`RaceConfig`], [`RoomStatus`],
//!   [`ReplayEvent`], [`RoomSnapshot`]) — race data that travels on the wire.
//! - **Events** ([`ClientEvent`], [`ServerEvent`]) — the inbound and
//!   outbound message sets.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — bytes ↔ values.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (events) → Session / Room
//! ```

mod codec;
mod error;
mod events;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use events::{
    ClientEvent, CreateRoom, Envelope, JoinRoom, ServerEvent, SubmitResult, TransferHost,
    UpdateProgress, UpdateSettings,
};
pub use types::{
    LeaderboardEntry, ParticipantView, RaceConfig, ReplayEvent, RoomId, RoomSnapshot, RoomStatus,
    SessionId, Timestamp, UserId,
};
