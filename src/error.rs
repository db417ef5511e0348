//! Error types for the speech pipeline.
//!
//! Only three error classes ever reach the caller: configuration errors
//! (caught before any network call), local device failures, and candidate
//! exhaustion carrying every attempted candidate's failure reason.
//! Per-candidate transport/timeout/decode failures are recovered internally
//! by failover and never surface individually. Cancellation is not an
//! error; it is reported as a distinct playback outcome.

use thiserror::Error;

use crate::provider::failover::AttemptRecord;

/// Errors surfaced by the speech pipeline.
#[derive(Error, Debug)]
pub enum SpeechError {
    /// Requested format or voice is unsupported by every configured
    /// candidate. Raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// The local output device failed. Aborts the session immediately;
    /// no failover, since the failure is not provider-specific.
    #[error("audio device error: {0}")]
    Device(String),

    /// Every candidate was attempted and failed.
    #[error("all {} synthesis candidates failed", .0.len())]
    Exhausted(Vec<AttemptRecord>),

    /// The bound candidate's stream or decode failed after playback had
    /// already begun. The candidate index is frozen by then, so there is
    /// no failover; replaying partial audio from another provider would
    /// be audibly wrong.
    #[error("playback aborted: {0}")]
    Aborted(String),

    /// Internal ordering/state contract violation (e.g. an out-of-order
    /// chunk reached the playback queue).
    #[error("pipeline protocol violation: {0}")]
    Protocol(String),
}

/// Convenience Result type using [`SpeechError`].
pub type Result<T> = std::result::Result<T, SpeechError>;
