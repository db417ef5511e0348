//! Audio fetching from synthesis endpoints.
//!
//! [`AudioFetcher`] is the seam between the failover coordinator and the
//! network. The production implementation talks to OpenAI-compatible
//! `POST {base}/audio/speech` endpoints and returns either the complete
//! payload or a live fragment stream, depending on the requested mode.

use std::future::Future;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info};

use super::{Candidate, PlaybackRequest};

/// Failure classes a fetch attempt can surface.
///
/// Never retried locally; the coordinator maps these onto failover.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection refused/reset, DNS failure, TLS failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport-level request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// A response arrived but is unusable (non-2xx, or the stream broke).
    #[error("unusable response: {0}")]
    BadResponse(String),
}

impl FetchError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(e.to_string())
        }
    }
}

/// A lazy, finite, non-restartable sequence of raw byte fragments.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Vec<u8>, FetchError>> + Send>>;

/// Result of one fetch attempt.
pub enum FetchedAudio {
    /// Complete payload, received within the attempt budget.
    Buffered(Vec<u8>),
    /// Fragments as they arrive over the network.
    Streaming(ByteStream),
}

/// Seam between the coordinator and the network (dyn-compatible).
pub trait AudioFetcher: Send + Sync {
    /// Issue the synthesis request for one resolved candidate.
    ///
    /// Buffered mode resolves with the whole payload; streaming mode
    /// resolves as soon as the response starts, with the body left to be
    /// pulled fragment by fragment.
    fn fetch(
        &self,
        candidate: &Candidate,
        request: &PlaybackRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedAudio, FetchError>> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// HTTP fetcher (OpenAI-compatible speech API)
// ---------------------------------------------------------------------------

/// Fetches audio from OpenAI-compatible `/audio/speech` endpoints.
pub struct HttpFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpFetcher {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn speech_url(base: &str) -> String {
        format!("{}/audio/speech", base.trim_end_matches('/'))
    }
}

impl AudioFetcher for HttpFetcher {
    fn fetch(
        &self,
        candidate: &Candidate,
        request: &PlaybackRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedAudio, FetchError>> + Send + '_>> {
        let url = Self::speech_url(&candidate.endpoint.base_url);
        let voice = candidate.voice.clone();
        let format = candidate.format;
        let body = serde_json::json!({
            "model": candidate.model,
            "input": request.text,
            "voice": candidate.voice,
            "response_format": candidate.format.as_str(),
        });
        let streaming = request.streaming;

        Box::pin(async move {
            info!(%url, %voice, %format, streaming, "Synthesis request");

            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req.send().await.map_err(FetchError::from_reqwest)?;

            let status = resp.status();
            if !status.is_success() {
                let detail = resp.text().await.unwrap_or_default();
                return Err(FetchError::BadResponse(format!(
                    "HTTP {}: {}",
                    status,
                    detail.chars().take(200).collect::<String>()
                )));
            }

            if streaming {
                let stream = resp
                    .bytes_stream()
                    .map(|item| match item {
                        Ok(bytes) => Ok(bytes.to_vec()),
                        Err(e) => Err(FetchError::from_reqwest(e)),
                    })
                    .boxed();
                Ok(FetchedAudio::Streaming(stream))
            } else {
                let bytes = resp.bytes().await.map_err(FetchError::from_reqwest)?;
                debug!(bytes = bytes.len(), "Payload received");
                Ok(FetchedAudio::Buffered(bytes.to_vec()))
            }
        })
    }
}
