//! Endpoint failover coordination.
//!
//! The coordinator consumes the ordered candidate list deterministically:
//! attempt, classify, record, advance. Candidates that do not declare
//! support for the requested format are skipped without a network call.
//! No candidate is retried within a session; on exhaustion the caller
//! gets every candidate's failure reason in order.

use std::future::Future;

use tracing::{info, warn};

use crate::error::SpeechError;
use crate::provider::{AudioFormat, Candidate};

/// Why one candidate attempt failed.
#[derive(Debug, Clone)]
pub enum FailureClass {
    /// Connection refused/reset or DNS failure.
    Connection(String),
    /// Attempt exceeded its timeout budget.
    Timeout,
    /// Candidate does not declare support for the requested format;
    /// skipped without a network call.
    UnsupportedFormat,
    /// Payload or response received but unusable (bad status, broken
    /// stream, decode failure). Treated identically to transport failure.
    Malformed(String),
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection failure: {}", msg),
            Self::Timeout => write!(f, "timed out"),
            Self::UnsupportedFormat => write!(f, "format not supported"),
            Self::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

/// Outcome of one candidate attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success,
    Failed(FailureClass),
}

/// Record of one attempt, appended in attempt order.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub candidate_index: usize,
    pub endpoint: String,
    pub voice: String,
    pub format: AudioFormat,
    pub outcome: AttemptOutcome,
}

/// A candidate the coordinator has committed to, plus the audio the
/// successful attempt produced and the full attempt history.
#[derive(Debug)]
pub struct BoundCandidate<T> {
    /// Index into the candidate list; frozen for the rest of the session.
    pub index: usize,
    pub audio: T,
    pub attempts: Vec<AttemptRecord>,
}

/// Drive attempts over `candidates` in order until one succeeds.
///
/// `attempt` performs the network fetch (and enough decode to know the
/// audio is playable) for one candidate; its error is the failure class
/// recorded for that candidate. Fails fast with a configuration error,
/// before invoking `attempt` at all, when no candidate supports the
/// requested format.
pub async fn drive<T, F, Fut>(
    candidates: &[Candidate],
    format: AudioFormat,
    mut attempt: F,
) -> Result<BoundCandidate<T>, SpeechError>
where
    F: FnMut(usize, Candidate) -> Fut,
    Fut: Future<Output = Result<T, FailureClass>>,
{
    if !candidates.iter().any(|c| c.endpoint.supports(format)) {
        return Err(SpeechError::Config(format!(
            "no configured endpoint supports format '{}'",
            format
        )));
    }

    let mut attempts = Vec::with_capacity(candidates.len());

    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.endpoint.supports(format) {
            // Would always fail remotely; skip to save the round trip.
            warn!(
                endpoint = %candidate.endpoint.base_url,
                %format,
                "Skipping candidate without format support"
            );
            attempts.push(record(index, candidate, AttemptOutcome::Failed(FailureClass::UnsupportedFormat)));
            continue;
        }

        info!(
            candidate = index,
            endpoint = %candidate.endpoint.base_url,
            voice = %candidate.voice,
            "Attempting candidate"
        );

        match attempt(index, candidate.clone()).await {
            Ok(audio) => {
                attempts.push(record(index, candidate, AttemptOutcome::Success));
                info!(candidate = index, "Candidate bound");
                return Ok(BoundCandidate {
                    index,
                    audio,
                    attempts,
                });
            }
            Err(class) => {
                warn!(candidate = index, reason = %class, "Candidate failed, advancing");
                attempts.push(record(index, candidate, AttemptOutcome::Failed(class)));
            }
        }
    }

    Err(SpeechError::Exhausted(attempts))
}

fn record(index: usize, candidate: &Candidate, outcome: AttemptOutcome) -> AttemptRecord {
    AttemptRecord {
        candidate_index: index,
        endpoint: candidate.endpoint.base_url.clone(),
        voice: candidate.voice.clone(),
        format: candidate.format,
        outcome,
    }
}
