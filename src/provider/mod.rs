//! Synthesis provider data model.
//!
//! An [`Endpoint`] describes one configured provider: where it lives, its
//! priority rank, and its declared capabilities (supported transport
//! formats, voice-name suffix requirement). A [`Candidate`] is one fully
//! resolved (endpoint, voice, model, format) combination the failover
//! coordinator will attempt.

pub mod failover;
pub mod fetch;

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Audio formats
// ---------------------------------------------------------------------------

/// Transport formats a provider can deliver.
///
/// No raw-PCM transport is assumed; every payload goes through a decode
/// strategy selected by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Opus,
}

impl AudioFormat {
    /// Wire value for the synthesis request's `response_format` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Endpoints and voices
// ---------------------------------------------------------------------------

/// One configured synthesis endpoint. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base URL including any API prefix (e.g. `http://127.0.0.1:8880/v1`).
    pub base_url: String,
    /// Priority rank; lower ranks are attempted first.
    pub priority: u32,
    /// Transport formats this endpoint declares support for.
    pub formats: Vec<AudioFormat>,
    /// Some endpoints resolve voices from files on disk and require the
    /// voice name to carry the file extension (e.g. `.pt`).
    #[serde(default)]
    pub voice_suffix: Option<String>,
}

impl Endpoint {
    /// Whether this endpoint declares support for `format`.
    pub fn supports(&self, format: AudioFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// A logical voice identifier, resolved per endpoint.
#[derive(Debug, Clone)]
pub struct VoiceSpec {
    pub id: String,
}

impl VoiceSpec {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    /// The concrete name string `endpoint` expects for this voice.
    pub fn resolve(&self, endpoint: &Endpoint) -> String {
        match &endpoint.voice_suffix {
            Some(suffix) if !self.id.ends_with(suffix.as_str()) => {
                format!("{}{}", self.id, suffix)
            }
            _ => self.id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and candidates
// ---------------------------------------------------------------------------

/// One synthesis request, created once per conversational turn.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub text: String,
    pub format: AudioFormat,
    pub voice: VoiceSpec,
    pub model: String,
    pub streaming: bool,
    /// Per-attempt timeout budget.
    pub timeout: Duration,
}

/// One resolved (endpoint, voice, model, format) combination.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: Endpoint,
    /// Voice name as this endpoint expects it.
    pub voice: String,
    pub model: String,
    pub format: AudioFormat,
}

/// Expand the ordered endpoint list into the candidate list for `request`.
///
/// Every endpoint yields a candidate, including ones that do not support
/// the requested format; the coordinator skips those without a network
/// call but still records the skip so exhaustion reports are complete.
pub fn build_candidates(endpoints: &[Endpoint], request: &PlaybackRequest) -> Vec<Candidate> {
    endpoints
        .iter()
        .map(|ep| Candidate {
            voice: request.voice.resolve(ep),
            model: request.model.clone(),
            format: request.format,
            endpoint: ep.clone(),
        })
        .collect()
}
