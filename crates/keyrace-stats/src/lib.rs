//! Typing metrics and result verification for Keyrace.
//!
//! - [`metrics`] — pure functions over keystroke logs: replay
//!   reconstruction, WPM, accuracy, exact-word counts.
//! - [`verify`] — digest check and claimed-vs-measured tolerance for
//!   submitted results.
//!
//! Neither module knows about rooms or connections; the room layer and
//! the server call in with plain values.

pub mod metrics;
pub mod verify;

pub use metrics::{
    FinalStats, calculate_accuracy, calculate_correct_characters, calculate_wpm,
    count_keystrokes, reconstruct_typed_text,
};
pub use verify::{SignedFields, Tolerance, VerifyError};
