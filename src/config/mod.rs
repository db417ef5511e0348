//! Pipeline configuration.
//!
//! Read once per session from `pipeline.json` in the data directory; never
//! mutated while a session is active. Holds the ordered synthesis endpoint
//! list plus voice/model defaults and the pipeline timing knobs.

pub mod paths;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::provider::{AudioFormat, Endpoint};
use paths::get_data_dir;

/// Default per-attempt timeout in milliseconds.
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 10_000;

/// Default cancellation poll interval in milliseconds.
const DEFAULT_CANCEL_POLL_MS: u64 = 30;

/// Default playback queue capacity in chunks (~5.5 s of audio at
/// 2048 samples per chunk, 24 kHz).
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Top-level pipeline.json shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Candidate synthesis endpoints, tried in ascending priority order.
    pub endpoints: Vec<Endpoint>,
    /// Default voice identifier (endpoint-specific suffixes are applied
    /// per attempt, never stored here).
    pub voice: String,
    /// Default synthesis model.
    pub model: String,
    /// Requested transport format.
    pub format: AudioFormat,
    /// Stream audio as it arrives instead of fetching the whole clip.
    pub streaming: bool,
    /// Per-attempt timeout budget in milliseconds.
    pub attempt_timeout_ms: u64,
    /// How often the work context polls the cancellation source.
    pub cancel_poll_ms: u64,
    /// Playback queue capacity in chunks.
    pub queue_capacity: usize,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// API key for endpoints that require one. Falls back to
    /// `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                Endpoint {
                    base_url: "http://127.0.0.1:8880/v1".into(),
                    priority: 0,
                    formats: vec![AudioFormat::Mp3, AudioFormat::Wav, AudioFormat::Opus],
                    voice_suffix: None,
                },
                Endpoint {
                    base_url: "https://api.openai.com/v1".into(),
                    priority: 1,
                    formats: vec![AudioFormat::Mp3, AudioFormat::Wav, AudioFormat::Opus],
                    voice_suffix: None,
                },
            ],
            voice: "af_sky".into(),
            model: "tts-1".into(),
            format: AudioFormat::Mp3,
            streaming: true,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            cancel_poll_ms: DEFAULT_CANCEL_POLL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            output_device: None,
            api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Read pipeline.json from the data directory, falling back to the
    /// built-in defaults if it is missing or unreadable.
    pub fn load() -> Self {
        read_json_file(&get_config_path()).unwrap_or_default()
    }

    /// Per-attempt timeout as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Cancellation poll interval as a [`Duration`].
    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }

    /// Resolve the API key, falling back to the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    /// Endpoints sorted by ascending priority rank.
    pub fn ordered_endpoints(&self) -> Vec<Endpoint> {
        let mut eps = self.endpoints.clone();
        eps.sort_by_key(|e| e.priority);
        eps
    }
}

/// Path to pipeline.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("pipeline.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.format, AudioFormat::Mp3);
        assert!(cfg.streaming);
        assert_eq!(cfg.cancel_poll(), Duration::from_millis(30));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"voice": "alloy", "streaming": false}"#).unwrap();
        assert_eq!(cfg.voice, "alloy");
        assert!(!cfg.streaming);
        assert_eq!(cfg.attempt_timeout_ms, DEFAULT_ATTEMPT_TIMEOUT_MS);
        assert_eq!(cfg.endpoints.len(), 2);
    }

    #[test]
    fn test_ordered_endpoints_sorts_by_priority() {
        let mut cfg = PipelineConfig::default();
        cfg.endpoints[0].priority = 5;
        let ordered = cfg.ordered_endpoints();
        assert!(ordered[0].priority <= ordered[1].priority);
        assert_eq!(ordered[0].base_url, "https://api.openai.com/v1");
    }
}
