//! Real-time playback primitives.
//!
//! The playback queue decouples the work context (network fetch, decode)
//! from the output device's strict timing. Everything downstream of the
//! decoder speaks the pipeline's internal format: mono f32 at 24 kHz.

pub mod device;
pub mod queue;

/// Fixed internal sample rate of the pipeline.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per audio chunk (~85 ms at 24 kHz).
pub const CHUNK_SAMPLES: usize = 2048;
