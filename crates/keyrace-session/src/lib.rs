//! Connection sessions for Keyrace.
//!
//! This crate tracks every live connection:
//!
//! 1. **Identity** — which room and participant a connection is bound to
//!    ([`Membership`]), plus an optional account resolved by the
//!    [`Authenticator`] hook.
//! 2. **Delivery** — the [`Outbound`] queue other tasks use to reach the
//!    client.
//! 3. **Liveness** — the heartbeat flag and terminate signal
//!    ([`SessionRegistry::heartbeat_sweep`]).
//!
//! ```text
//! Room Layer (above)     ← delivers events through OutboundSender
//!     ↕
//! Session Layer (this)   ← connection ↔ room/participant bindings
//!     ↕
//! Transport (below)      ← ConnectionId
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod error;
mod manager;
mod session;

pub use auth::{Authenticator, GuestOnly, StaticTokens};
pub use error::SessionError;
pub use manager::{HeartbeatSweep, SessionRegistry, generate_session_id};
pub use session::{Membership, Outbound, OutboundSender, Session, deliver};
