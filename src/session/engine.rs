//! Streaming/buffering engine.
//!
//! Bridges decoder output into the playback queue under the two feed
//! disciplines, and owns the drain loop that moves chunks from the queue
//! into the output device. The engine is also where one candidate
//! "attempt" is defined: fetch under the timeout budget, plus enough
//! decode to know the audio is playable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decode::{self, stream::FragmentReader, DecodeError};
use crate::playback::device::{DeviceError, DeviceFactory, DeviceGuard};
use crate::playback::queue::{chunk_queue, ChunkConsumer, ChunkProducer, QueuePoll};
use crate::provider::fetch::{AudioFetcher, ByteStream, FetchError, FetchedAudio};
use crate::provider::failover::FailureClass;
use crate::provider::{AudioFormat, Candidate, PlaybackRequest};
use crate::session::SessionStateMachine;

/// Audio a successful attempt produced, ready to feed the queue.
pub(crate) enum PreparedAudio {
    /// Whole clip decoded into chunk sample buffers.
    Buffered(Vec<Vec<f32>>),
    /// Live stream: the first fragment already arrived (that instant is
    /// the time-to-first-audio mark); the rest is pulled during feeding.
    Streaming {
        first_fragment: Vec<u8>,
        rest: ByteStream,
        format: AudioFormat,
    },
}

/// One candidate attempt: fetch under the request's timeout budget, then
/// prove the audio playable (full decode in buffered mode, stream start
/// plus first fragment in streaming mode).
pub(crate) async fn attempt(
    fetcher: &dyn AudioFetcher,
    candidate: &Candidate,
    request: &PlaybackRequest,
) -> Result<PreparedAudio, FailureClass> {
    let fetched = match tokio::time::timeout(request.timeout, fetcher.fetch(candidate, request)).await
    {
        Err(_) => return Err(FailureClass::Timeout),
        Ok(Err(e)) => return Err(classify(e)),
        Ok(Ok(f)) => f,
    };

    match fetched {
        FetchedAudio::Buffered(payload) => {
            let format = candidate.format;
            let chunks = tokio::task::spawn_blocking(move || decode::decode_payload(payload, format))
                .await
                .map_err(|e| FailureClass::Malformed(format!("decode task failed: {}", e)))?
                .map_err(|e| FailureClass::Malformed(e.to_string()))?;
            Ok(PreparedAudio::Buffered(chunks))
        }
        FetchedAudio::Streaming(mut stream) => {
            // The first fragment must also arrive within the budget.
            match tokio::time::timeout(request.timeout, stream.next()).await {
                Err(_) => Err(FailureClass::Timeout),
                Ok(None) => Err(FailureClass::Malformed("empty audio stream".into())),
                Ok(Some(Err(e))) => Err(classify(e)),
                Ok(Some(Ok(first_fragment))) => Ok(PreparedAudio::Streaming {
                    first_fragment,
                    rest: stream,
                    format: candidate.format,
                }),
            }
        }
    }
}

fn classify(e: FetchError) -> FailureClass {
    match e {
        FetchError::Connection(m) => FailureClass::Connection(m),
        FetchError::Timeout => FailureClass::Timeout,
        FetchError::BadResponse(m) => FailureClass::Malformed(m),
    }
}

// ---------------------------------------------------------------------------
// Feed + drain
// ---------------------------------------------------------------------------

/// Everything the engine needs to run one session's playback phase.
pub(crate) struct EnginePlan {
    pub prepared: PreparedAudio,
    pub queue_capacity: usize,
    /// Shared poll interval: producer suspension, drain idle wait, and
    /// cancellation observation all run on this cadence.
    pub poll: Duration,
    pub device_factory: DeviceFactory,
    /// Set externally on cancellation, or internally on feed abort; both
    /// engine sides observe it every poll interval.
    pub halt: Arc<AtomicBool>,
    pub state: Arc<SessionStateMachine>,
    /// Set when the first playable chunk is enqueued (generation mark).
    pub first_chunk: Arc<OnceLock<Instant>>,
}

/// How the playback phase ended.
pub(crate) enum SessionEnd {
    /// End-of-stream consumed; all audio delivered.
    Completed,
    /// Halt flag observed; backlog discarded, device stopped.
    Halted,
    /// The bound candidate's stream or decode failed after playback began.
    Aborted(String),
    /// The output device failed. Not a provider problem; no failover.
    DeviceFailed(DeviceError),
    /// Queue ordering contract broken.
    Protocol(String),
}

pub(crate) struct PlayResult {
    pub end: SessionEnd,
    /// Samples delivered to the device, at the pipeline rate.
    pub written_samples: u64,
    pub underruns: u64,
}

enum FeedEnd {
    Clean,
    Halted,
    Aborted(String),
}

/// Run the feed and drain sides of one session to completion.
pub(crate) async fn play(plan: EnginePlan) -> PlayResult {
    let EnginePlan {
        prepared,
        queue_capacity,
        poll,
        device_factory,
        halt,
        state,
        first_chunk,
    } = plan;

    let (producer, consumer) = chunk_queue(queue_capacity, poll);

    let drain_halt = Arc::clone(&halt);
    let drain_state = Arc::clone(&state);
    let drain = tokio::task::spawn_blocking(move || {
        drain_loop(consumer, device_factory, drain_halt, drain_state, poll)
    });

    state.begin_feeding(matches!(prepared, PreparedAudio::Streaming { .. }));

    let feed_end = match prepared {
        PreparedAudio::Buffered(chunks) => {
            feed_buffered(producer, chunks, Arc::clone(&halt), first_chunk).await
        }
        PreparedAudio::Streaming {
            first_fragment,
            rest,
            format,
        } => {
            feed_streaming(
                producer,
                first_fragment,
                rest,
                format,
                Arc::clone(&halt),
                first_chunk,
            )
            .await
        }
    };

    if let FeedEnd::Aborted(_) = &feed_end {
        // No end-of-stream is coming; release the drain loop.
        halt.store(true, Ordering::Release);
    }

    let (drain_end, written_samples, underruns) = match drain.await {
        Ok(result) => result,
        Err(e) => (
            SessionEnd::Protocol(format!("drain task failed: {}", e)),
            0,
            0,
        ),
    };

    // Device and protocol failures outrank everything; a feed abort
    // outranks the halt it triggered.
    let end = match (feed_end, drain_end) {
        (_, SessionEnd::DeviceFailed(e)) => SessionEnd::DeviceFailed(e),
        (_, SessionEnd::Protocol(m)) => SessionEnd::Protocol(m),
        (FeedEnd::Aborted(m), _) => SessionEnd::Aborted(m),
        (_, drain_end) => drain_end,
    };

    PlayResult {
        end,
        written_samples,
        underruns,
    }
}

/// Buffered discipline: everything is already decoded; enqueue all
/// chunks, then the end-of-stream marker.
async fn feed_buffered(
    mut producer: ChunkProducer,
    chunks: Vec<Vec<f32>>,
    halt: Arc<AtomicBool>,
    first_chunk: Arc<OnceLock<Instant>>,
) -> FeedEnd {
    debug!(chunks = chunks.len(), "Feeding buffered clip");
    for samples in chunks {
        if halt.load(Ordering::Acquire) {
            return FeedEnd::Halted;
        }
        let _ = first_chunk.set(Instant::now());
        if producer.push(samples, false).await.is_err() {
            return FeedEnd::Halted;
        }
    }
    if halt.load(Ordering::Acquire) {
        return FeedEnd::Halted;
    }
    match producer.finish().await {
        Ok(()) => FeedEnd::Clean,
        Err(_) => FeedEnd::Halted,
    }
}

/// Streaming discipline: forward network fragments into the decoder and
/// enqueue each chunk as soon as it is decoded. The end-of-stream marker
/// is enqueued only after the fragment sequence is exhausted cleanly.
async fn feed_streaming(
    mut producer: ChunkProducer,
    first_fragment: Vec<u8>,
    mut rest: ByteStream,
    format: AudioFormat,
    halt: Arc<AtomicBool>,
    first_chunk: Arc<OnceLock<Instant>>,
) -> FeedEnd {
    let (frag_tx, frag_rx) = mpsc::channel::<Vec<u8>>(16);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<f32>>(8);

    // Decode thread: blocks on fragments, emits chunks as decoded.
    let decode_task = tokio::task::spawn_blocking(move || {
        decode::decode_fragments(FragmentReader::new(frag_rx), format, &mut |chunk| {
            chunk_tx.blocking_send(chunk).is_ok()
        })
    });

    // Forwarder: network fragments into the decoder. Returns the stream
    // error message, if the sequence did not end cleanly.
    let halt_fwd = Arc::clone(&halt);
    let forward_task = tokio::spawn(async move {
        if frag_tx.send(first_fragment).await.is_err() {
            return None;
        }
        while let Some(item) = rest.next().await {
            if halt_fwd.load(Ordering::Acquire) {
                return None;
            }
            match item {
                Ok(fragment) => {
                    if frag_tx.send(fragment).await.is_err() {
                        return None;
                    }
                }
                Err(e) => {
                    warn!("Audio stream broke mid-clip: {}", e);
                    return Some(e.to_string());
                }
            }
        }
        None
    });

    let mut end = FeedEnd::Clean;
    while let Some(samples) = chunk_rx.recv().await {
        if halt.load(Ordering::Acquire) {
            end = FeedEnd::Halted;
            break;
        }
        let _ = first_chunk.set(Instant::now());
        if producer.push(samples, false).await.is_err() {
            end = FeedEnd::Halted;
            break;
        }
    }
    // Unblock the decode thread if we bailed out before it finished.
    drop(chunk_rx);

    let stream_error = forward_task
        .await
        .unwrap_or_else(|e| Some(format!("stream task failed: {}", e)));
    let decode_result = decode_task
        .await
        .unwrap_or_else(|e| Err(DecodeError(format!("decode task failed: {}", e))));

    if matches!(end, FeedEnd::Clean) {
        if halt.load(Ordering::Acquire) {
            return FeedEnd::Halted;
        }
        if let Some(msg) = stream_error {
            return FeedEnd::Aborted(format!("stream failed: {}", msg));
        }
        if let Err(e) = decode_result {
            return FeedEnd::Aborted(e.to_string());
        }
        if producer.finish().await.is_err() {
            return FeedEnd::Halted;
        }
    }
    end
}

/// Consumer side: move chunks from the queue into the device.
///
/// Runs on a blocking thread and constructs the device there (cpal
/// streams must stay on the thread that owns them). Never waits on the
/// queue: an empty poll sleeps one interval and tries again, while the
/// device's own callback covers the gap with silence.
fn drain_loop(
    mut consumer: ChunkConsumer,
    factory: DeviceFactory,
    halt: Arc<AtomicBool>,
    state: Arc<SessionStateMachine>,
    poll: Duration,
) -> (SessionEnd, u64, u64) {
    let device = match factory(Arc::clone(&halt)) {
        Ok(d) => d,
        Err(e) => {
            state.fail();
            return (SessionEnd::DeviceFailed(e), 0, 0);
        }
    };
    let mut guard = DeviceGuard::new(device);
    let mut written: u64 = 0;

    loop {
        if halt.load(Ordering::Acquire) {
            let discarded = consumer.discard_pending();
            if discarded > 0 {
                info!(discarded, "Halt observed, discarding queued audio");
            }
            guard.stop();
            return (SessionEnd::Halted, written, consumer.underruns());
        }

        match consumer.poll() {
            Ok(QueuePoll::Chunk(chunk)) => {
                if chunk.end_of_stream {
                    state.begin_draining();
                    return (SessionEnd::Completed, written, consumer.underruns());
                }
                if written == 0 && !chunk.samples.is_empty() {
                    state.begin_playing();
                }
                if let Err(e) = guard.write(&chunk.samples) {
                    state.fail();
                    guard.stop();
                    return (SessionEnd::DeviceFailed(e), written, consumer.underruns());
                }
                written += chunk.samples.len() as u64;
            }
            Ok(QueuePoll::Empty) => std::thread::sleep(poll),
            Ok(QueuePoll::Drained) => {
                return (SessionEnd::Completed, written, consumer.underruns())
            }
            Err(e) => {
                state.fail();
                guard.stop();
                return (SessionEnd::Protocol(e.to_string()), written, consumer.underruns());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::device::OutputDevice;
    use crate::playback::CHUNK_SAMPLES;
    use std::sync::Mutex;

    struct TestDevice {
        written: Arc<Mutex<u64>>,
        stops: Arc<Mutex<u32>>,
        fail_after_writes: Option<u32>,
        write_delay: Option<Duration>,
        writes: u32,
    }

    impl OutputDevice for TestDevice {
        fn write(&mut self, samples: &[f32]) -> Result<(), DeviceError> {
            if let Some(limit) = self.fail_after_writes {
                if self.writes >= limit {
                    return Err(DeviceError("simulated device failure".into()));
                }
            }
            if let Some(delay) = self.write_delay {
                std::thread::sleep(delay);
            }
            self.writes += 1;
            *self.written.lock().unwrap() += samples.len() as u64;
            Ok(())
        }
        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
        }
        fn close(&mut self) {}
    }

    fn test_factory(
        written: Arc<Mutex<u64>>,
        stops: Arc<Mutex<u32>>,
        fail_after_writes: Option<u32>,
        write_delay: Option<Duration>,
    ) -> DeviceFactory {
        Arc::new(move |_halt| {
            Ok(Box::new(TestDevice {
                written: Arc::clone(&written),
                stops: Arc::clone(&stops),
                fail_after_writes,
                write_delay,
                writes: 0,
            }) as Box<dyn OutputDevice>)
        })
    }

    fn make_plan(prepared: PreparedAudio, factory: DeviceFactory, halt: Arc<AtomicBool>) -> EnginePlan {
        let state = SessionStateMachine::new();
        state.begin_fetching();
        EnginePlan {
            prepared,
            queue_capacity: 16,
            poll: Duration::from_millis(5),
            device_factory: factory,
            halt,
            state,
            first_chunk: Arc::new(OnceLock::new()),
        }
    }

    #[tokio::test]
    async fn test_buffered_play_delivers_all_samples() {
        let written = Arc::new(Mutex::new(0u64));
        let stops = Arc::new(Mutex::new(0u32));
        let chunks = vec![vec![0.1f32; CHUNK_SAMPLES]; 5];
        let halt = Arc::new(AtomicBool::new(false));

        let plan = make_plan(
            PreparedAudio::Buffered(chunks),
            test_factory(Arc::clone(&written), Arc::clone(&stops), None, None),
            halt,
        );
        let state = Arc::clone(&plan.state);

        let result = play(plan).await;
        assert!(matches!(result.end, SessionEnd::Completed));
        assert_eq!(result.written_samples, (CHUNK_SAMPLES * 5) as u64);
        assert_eq!(*written.lock().unwrap(), (CHUNK_SAMPLES * 5) as u64);
        assert_eq!(state.current(), crate::session::SessionState::Draining);
    }

    #[tokio::test]
    async fn test_halt_discards_backlog_and_stops_device() {
        let written = Arc::new(Mutex::new(0u64));
        let stops = Arc::new(Mutex::new(0u32));
        let chunks = vec![vec![0.1f32; CHUNK_SAMPLES]; 50];
        let halt = Arc::new(AtomicBool::new(false));

        let plan = make_plan(
            PreparedAudio::Buffered(chunks),
            test_factory(
                Arc::clone(&written),
                Arc::clone(&stops),
                None,
                Some(Duration::from_millis(10)),
            ),
            Arc::clone(&halt),
        );

        let halt_setter = Arc::clone(&halt);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            halt_setter.store(true, Ordering::Release);
        });

        let result = play(plan).await;
        assert!(matches!(result.end, SessionEnd::Halted));
        assert!(*stops.lock().unwrap() >= 1);
        // The backlog was not played out.
        assert!(result.written_samples < (CHUNK_SAMPLES * 50) as u64);
    }

    #[tokio::test]
    async fn test_device_failure_fails_session_without_retry() {
        let written = Arc::new(Mutex::new(0u64));
        let stops = Arc::new(Mutex::new(0u32));
        let chunks = vec![vec![0.1f32; CHUNK_SAMPLES]; 8];
        let halt = Arc::new(AtomicBool::new(false));

        let plan = make_plan(
            PreparedAudio::Buffered(chunks),
            test_factory(Arc::clone(&written), Arc::clone(&stops), Some(2), None),
            halt,
        );
        let state = Arc::clone(&plan.state);

        let result = play(plan).await;
        assert!(matches!(result.end, SessionEnd::DeviceFailed(_)));
        assert_eq!(state.current(), crate::session::SessionState::Failed);
        assert!(*stops.lock().unwrap() >= 1);
    }
}
