//! # Keyrace
//!
//! Real-time multiplayer typing races over WebSockets.
//!
//! Clients create a room, share its six-character code, join, and race on
//! the same text. The server owns the room lifecycle (lobby, countdown,
//! race, results), relays live progress, ranks finishers, and recomputes
//! each submitted result from its keystroke replay before saving it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keyrace::prelude::*;
//!
//! # async fn start() -> Result<(), KeyraceError> {
//! let server = KeyraceServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .authenticator(StaticTokens::new().with("token-abc", "user-1"))
//!     .results(InMemoryResultStore::new())
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod collaborators;
mod config;
mod error;
mod handler;
mod server;

pub use collaborators::{
    InMemoryResultStore, NoopResultStore, ResultRecord, ResultStore, StaticWordSource,
    StoredResult, WordSource,
};
pub use config::{
    BIND_ENV, COUNTDOWN_MS_ENV, GRACE_SECS_ENV, HEARTBEAT_SECS_ENV, RESULT_SECRET_ENV,
    ServerConfig,
};
pub use error::KeyraceError;
pub use server::{KeyraceServer, KeyraceServerBuilder, ServerHandle};

/// Convenience re-exports for common usage.
///
/// ```rust
/// use keyrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        InMemoryResultStore, KeyraceError, KeyraceServer, KeyraceServerBuilder, NoopResultStore,
        ResultRecord, ResultStore, ServerConfig, ServerHandle, StaticWordSource, StoredResult,
        WordSource,
    };

    pub use keyrace_protocol::{
        ClientEvent, LeaderboardEntry, ParticipantView, RaceConfig, ReplayEvent, RoomId,
        RoomSnapshot, RoomStatus, ServerEvent, SessionId, SubmitResult, Timestamp, UserId,
    };
    pub use keyrace_room::{InMemoryRoomDirectory, RoomDirectory, RoomError};
    pub use keyrace_session::{Authenticator, GuestOnly, SessionError, StaticTokens};
    pub use keyrace_stats::{FinalStats, SignedFields, Tolerance, VerifyError};
}
