//! speech-core: real-time speech-audio delivery pipeline.
//!
//! Turns synthesized-speech bytes from remote text-to-speech providers
//! into audio played through a local output device without audible gaps.
//! Supports buffered (fetch whole clip, then play) and streaming (play as
//! it arrives) modes, and fails over across an ordered candidate list
//! when a provider is unreachable, slow, or returns unusable audio.
//!
//! The flow per conversational turn: the failover coordinator selects a
//! candidate, the fetcher requests audio, the decoder produces sample
//! chunks, the streaming engine feeds the bounded playback queue, and the
//! output device drains it. Timing and outcome data comes back to the
//! caller as a [`PlaybackReport`].

pub mod cancel;
pub mod config;
pub mod decode;
pub mod error;
pub mod playback;
pub mod provider;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::info;
use tracing_subscriber::EnvFilter;

pub use cancel::{CancelHandle, CancelSource};
pub use config::PipelineConfig;
pub use error::{Result, SpeechError};
pub use playback::device::{CpalDevice, DeviceError, DeviceFactory, OutputDevice};
pub use playback::{CHUNK_SAMPLES, SAMPLE_RATE};
pub use provider::failover::{AttemptOutcome, AttemptRecord, FailureClass};
pub use provider::fetch::{AudioFetcher, ByteStream, FetchError, FetchedAudio, HttpFetcher};
pub use provider::{AudioFormat, Candidate, Endpoint, PlaybackRequest, VoiceSpec};
pub use session::{PlaybackOutcome, PlaybackReport, SessionState};

use provider::{build_candidates, failover};
use session::engine::{self, EnginePlan, SessionEnd};
use session::PlaybackSession;

/// Initialize tracing (respects RUST_LOG env, defaults to info).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// The speech delivery pipeline.
///
/// Owns the read-only configuration, the network and device seams, and
/// the cancellation source. At most one playback session is active at a
/// time; a second request waits until the prior session reaches a
/// terminal state.
pub struct SpeechPipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn AudioFetcher>,
    device_factory: DeviceFactory,
    cancel: Arc<CancelSource>,
    /// Single playback slot; held for the session's lifetime, acquired
    /// and released without any lock spanning network or device calls.
    gate: tokio::sync::Semaphore,
}

impl SpeechPipeline {
    /// Pipeline with the production HTTP fetcher and cpal output.
    pub fn new(config: PipelineConfig) -> Self {
        let fetcher = Arc::new(HttpFetcher::new(config.resolve_api_key()));
        let device_name = config.output_device.clone();
        let device_factory: DeviceFactory = Arc::new(move |halt| {
            CpalDevice::open(device_name.as_deref(), halt)
                .map(|d| Box::new(d) as Box<dyn OutputDevice>)
        });
        Self::with_parts(config, fetcher, device_factory, CancelSource::in_data_dir())
    }

    /// Pipeline with explicit fetcher, device, and cancellation seams.
    pub fn with_parts(
        config: PipelineConfig,
        fetcher: Arc<dyn AudioFetcher>,
        device_factory: DeviceFactory,
        cancel: CancelSource,
    ) -> Self {
        Self {
            config,
            fetcher,
            device_factory,
            cancel: Arc::new(cancel),
            gate: tokio::sync::Semaphore::new(1),
        }
    }

    /// Handle for cancelling the active session from inside the process.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.handle()
    }

    /// Speak `text` with the configured voice, model, format, and mode.
    pub async fn speak(&self, text: &str) -> Result<PlaybackReport> {
        let request = PlaybackRequest {
            text: text.to_string(),
            format: self.config.format,
            voice: VoiceSpec::new(&self.config.voice),
            model: self.config.model.clone(),
            streaming: self.config.streaming,
            timeout: self.config.attempt_timeout(),
        };
        self.speak_request(request).await
    }

    /// Run one playback session for an explicit request.
    pub async fn speak_request(&self, request: PlaybackRequest) -> Result<PlaybackReport> {
        if !decode::supported(request.format) {
            return Err(SpeechError::Config(format!(
                "no decode strategy registered for format '{}'",
                request.format
            )));
        }
        let endpoints = self.config.ordered_endpoints();
        if endpoints.is_empty() {
            return Err(SpeechError::Config("no synthesis endpoints configured".into()));
        }
        let candidates = build_candidates(&endpoints, &request);

        // Wait for any prior session to reach a terminal state.
        let _slot = self
            .gate
            .acquire()
            .await
            .map_err(|_| SpeechError::Protocol("pipeline gate closed".into()))?;

        // A stop signal issued while nothing was playing is stale; it must
        // not cancel this fresh session.
        if self.cancel.observe() {
            info!("Discarding stale stop signal");
        }

        let mut session = PlaybackSession::new();
        info!(
            id = %session.id,
            text_len = request.text.len(),
            format = %request.format,
            streaming = request.streaming,
            "Starting playback session"
        );
        session.state.begin_fetching();

        let halt = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(cancel::watch(
            Arc::clone(&self.cancel),
            Arc::clone(&halt),
            Arc::clone(&cancelled),
            self.config.cancel_poll(),
        ));

        let result = self
            .drive_session(&mut session, &candidates, &request, halt, cancelled)
            .await;
        watcher.abort();

        match &result {
            Ok(report) => info!(
                id = %session.id,
                outcome = ?report.outcome,
                candidate = report.candidate_index,
                play_secs = format!("{:.2}", report.play_time.as_secs_f64()),
                "Session finished"
            ),
            Err(e) => info!(id = %session.id, error = %e, "Session failed"),
        }
        result
    }

    async fn drive_session(
        &self,
        session: &mut PlaybackSession,
        candidates: &[provider::Candidate],
        request: &PlaybackRequest,
        halt: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<PlaybackReport> {
        let fetcher = Arc::clone(&self.fetcher);
        let bound = failover::drive(candidates, request.format, |_index, candidate| {
            let fetcher = Arc::clone(&fetcher);
            let request = request.clone();
            async move { engine::attempt(fetcher.as_ref(), &candidate, &request).await }
        })
        .await;

        let bound = match bound {
            Ok(b) => b,
            Err(e) => {
                session.state.fail();
                return Err(e);
            }
        };
        session.bind_candidate(bound.index);
        session.mark_first_audio();

        let first_chunk: Arc<OnceLock<Instant>> = Arc::new(OnceLock::new());
        let stats = engine::play(EnginePlan {
            prepared: bound.audio,
            queue_capacity: self.config.queue_capacity,
            poll: self.config.cancel_poll(),
            device_factory: Arc::clone(&self.device_factory),
            halt,
            state: Arc::clone(&session.state),
            first_chunk: Arc::clone(&first_chunk),
        })
        .await;

        let generation_time = first_chunk
            .get()
            .map(|t| t.duration_since(session.started()))
            .unwrap_or_else(|| session.started().elapsed());
        let play_time =
            Duration::from_secs_f64(stats.written_samples as f64 / SAMPLE_RATE as f64);
        let underruns = stats.underruns;

        let report = |outcome| PlaybackReport {
            session_id: session.id,
            outcome,
            candidate_index: bound.index,
            generation_time,
            time_to_first_audio: session.time_to_first_audio(),
            play_time,
            underruns,
            attempts: bound.attempts.clone(),
        };

        match stats.end {
            SessionEnd::Completed => {
                session.state.complete();
                Ok(report(PlaybackOutcome::Completed))
            }
            SessionEnd::Halted => {
                if cancelled.load(Ordering::Acquire) {
                    // Early termination on request; not a failure.
                    session.state.begin_draining();
                    session.state.complete();
                    Ok(report(PlaybackOutcome::Cancelled))
                } else {
                    session.state.fail();
                    Err(SpeechError::Protocol(
                        "playback halted without a cancellation signal".into(),
                    ))
                }
            }
            SessionEnd::Aborted(msg) => {
                session.state.fail();
                Err(SpeechError::Aborted(msg))
            }
            SessionEnd::DeviceFailed(e) => Err(SpeechError::Device(e.to_string())),
            SessionEnd::Protocol(msg) => {
                session.state.fail();
                Err(SpeechError::Protocol(msg))
            }
        }
    }
}
