//! Playback session lifecycle.
//!
//! Exactly one session is active per conversational turn. The state
//! machine is shared between the work context and the drain loop as an
//! atomic, with compare-and-swap transitions; `Failed` is reachable from
//! any non-terminal state.

pub(crate) mod engine;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::provider::failover::AttemptRecord;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Session created, no candidate chosen yet.
    Idle = 0,
    /// Candidate selected; fetch in flight.
    Fetching = 1,
    /// Buffered mode: waiting for full-clip decode before enqueueing.
    Buffering = 2,
    /// Streaming mode: chunks enqueued as they arrive.
    Streaming = 3,
    /// The queue has emitted its first audio to the device.
    Playing = 4,
    /// End-of-stream enqueued; consumer finishing buffered audio.
    Draining = 5,
    /// Terminal success.
    Complete = 6,
    /// Terminal failure.
    Failed = 7,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Fetching,
            2 => Self::Buffering,
            3 => Self::Streaming,
            4 => Self::Playing,
            5 => Self::Draining,
            6 => Self::Complete,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Buffering => write!(f, "buffering"),
            Self::Streaming => write!(f, "streaming"),
            Self::Playing => write!(f, "playing"),
            Self::Draining => write!(f, "draining"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Thread-safe session state, shareable via `Arc`.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: AtomicU8,
}

impl SessionStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(SessionState::Idle as u8),
        })
    }

    pub fn current(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle -> Fetching.
    pub fn begin_fetching(&self) -> bool {
        self.cas(SessionState::Idle, SessionState::Fetching)
    }

    /// Fetching -> Buffering or Streaming.
    pub fn begin_feeding(&self, streaming: bool) -> bool {
        let to = if streaming {
            SessionState::Streaming
        } else {
            SessionState::Buffering
        };
        self.cas(SessionState::Fetching, to)
    }

    /// Buffering/Streaming -> Playing.
    pub fn begin_playing(&self) -> bool {
        self.cas(SessionState::Buffering, SessionState::Playing)
            || self.cas(SessionState::Streaming, SessionState::Playing)
    }

    /// Any non-terminal state -> Draining.
    pub fn begin_draining(&self) -> bool {
        loop {
            let cur = self.current();
            if cur.is_terminal() || cur == SessionState::Draining {
                return false;
            }
            if self.cas(cur, SessionState::Draining) {
                return true;
            }
        }
    }

    /// Draining -> Complete.
    pub fn complete(&self) -> bool {
        self.cas(SessionState::Draining, SessionState::Complete)
    }

    /// Any non-terminal state -> Failed.
    pub fn fail(&self) -> bool {
        loop {
            let cur = self.current();
            if cur.is_terminal() {
                return false;
            }
            if self.cas(cur, SessionState::Failed) {
                return true;
            }
        }
    }
}

/// One playback session. Owned by the pipeline driver; the state machine
/// is the only part shared with other execution contexts.
pub struct PlaybackSession {
    pub id: Uuid,
    pub state: Arc<SessionStateMachine>,
    started: Instant,
    candidate_index: Option<usize>,
    time_to_first_audio: Option<Duration>,
}

impl PlaybackSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionStateMachine::new(),
            started: Instant::now(),
            candidate_index: None,
            time_to_first_audio: None,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Freeze the bound candidate index. The index only ever increases and
    /// is set at most once.
    pub fn bind_candidate(&mut self, index: usize) {
        debug_assert!(self.candidate_index.is_none());
        self.candidate_index = Some(index);
    }

    pub fn candidate_index(&self) -> Option<usize> {
        self.candidate_index
    }

    pub fn mark_first_audio(&mut self) {
        if self.time_to_first_audio.is_none() {
            self.time_to_first_audio = Some(self.started.elapsed());
        }
    }

    pub fn time_to_first_audio(&self) -> Option<Duration> {
        self.time_to_first_audio
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// How a session ended. Cancellation is an early but successful
/// termination, distinct from failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
}

/// Metrics handed back to the caller after a session reaches a terminal
/// state. Append-only while the session runs.
#[derive(Debug)]
pub struct PlaybackReport {
    pub session_id: Uuid,
    pub outcome: PlaybackOutcome,
    /// Candidate the session ended up bound to.
    pub candidate_index: usize,
    /// Fetch + decode time until the first playable chunk was available.
    pub generation_time: Duration,
    /// Request start until the first audio arrived from the provider.
    pub time_to_first_audio: Option<Duration>,
    /// Audio actually delivered to the device.
    pub play_time: Duration,
    /// Queue underruns observed after playback started.
    pub underruns: u64,
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
}
