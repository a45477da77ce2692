//! Result integrity checks.
//!
//! A client signs its submission with a SHA-256 digest over the reported
//! figures, the race text, and a secret it shares with the server. A
//! matching digest proves the payload wasn't altered after signing; it
//! says nothing about whether the figures are honest. That is what the
//! optional [`Tolerance`] check against server-recomputed stats is for.

use sha2::{Digest, Sha256};

use keyrace_protocol::{SubmitResult, Timestamp};

use crate::FinalStats;

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    /// The digest doesn't match the payload.
    #[error("result hash mismatch")]
    HashMismatch,

    /// The client's claims are too far from what the replay shows.
    #[error("{metric} differs from server value: claimed {claimed:.2}, measured {measured:.2}")]
    ToleranceExceeded {
        metric: &'static str,
        claimed: f64,
        measured: f64,
    },
}

/// The fields covered by the digest, in signing order.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub wpm: f64,
    pub raw: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub afk_duration: f64,
    pub target_text: &'a str,
}

impl<'a> SignedFields<'a> {
    /// Picks the signed fields out of a submission.
    pub fn from_submission(result: &SubmitResult, target_text: &'a str) -> Self {
        Self {
            wpm: result.wpm,
            raw: result.raw,
            accuracy: result.accuracy,
            consistency: result.consistency,
            start_time: result.start_time,
            end_time: result.end_time,
            afk_duration: result.afk_duration,
            target_text,
        }
    }

    /// Lowercase hex SHA-256 over the fields followed by `secret`.
    ///
    /// Fields are concatenated without separators; numbers use their
    /// shortest decimal form (`72`, not `72.0`).
    pub fn digest(&self, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}{}{}{}{}{}{}{}{}",
                self.wpm,
                self.raw,
                self.accuracy,
                self.consistency,
                self.start_time,
                self.end_time,
                self.afk_duration,
                self.target_text,
                secret,
            )
            .as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    /// Checks a client-supplied digest.
    ///
    /// # Errors
    /// Returns [`VerifyError::HashMismatch`] when it doesn't match.
    pub fn verify(&self, secret: &str, claimed: &str) -> Result<(), VerifyError> {
        let expected = self.digest(secret);
        if constant_time_eq(expected.as_bytes(), claimed.trim().to_ascii_lowercase().as_bytes()) {
            Ok(())
        } else {
            Err(VerifyError::HashMismatch)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// How far client-claimed figures may stray from the server's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Absolute WPM margin.
    pub wpm: f64,
    /// Absolute accuracy margin, in percentage points.
    pub accuracy: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            wpm: 5.0,
            accuracy: 2.0,
        }
    }
}

impl Tolerance {
    /// Compares claimed speed and accuracy against measured stats.
    ///
    /// # Errors
    /// Returns [`VerifyError::ToleranceExceeded`] for the first metric
    /// outside its margin.
    pub fn check(
        &self,
        claimed_wpm: f64,
        claimed_accuracy: f64,
        measured: &FinalStats,
    ) -> Result<(), VerifyError> {
        if (claimed_wpm - measured.wpm).abs() > self.wpm {
            return Err(VerifyError::ToleranceExceeded {
                metric: "wpm",
                claimed: claimed_wpm,
                measured: measured.wpm,
            });
        }
        if (claimed_accuracy - measured.accuracy).abs() > self.accuracy {
            return Err(VerifyError::ToleranceExceeded {
                metric: "accuracy",
                claimed: claimed_accuracy,
                measured: measured.accuracy,
            });
        }
        Ok(())
    }
}
