//! Audio decoding via symphonia.
//!
//! One decode strategy per supported transport format (WAV, MP3, ogg/opus),
//! selected purely by the format tag. Output is always the pipeline's
//! internal representation: mono f32 at 24 kHz, cut into fixed-size sample
//! chunks. A malformed payload is a decode error; the coordinator treats it
//! exactly like a remote failure and advances to the next candidate.

pub mod stream;

use std::io::Cursor;
use std::sync::OnceLock;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecRegistry, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia_adapter_libopus::OpusDecoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::playback::{CHUNK_SAMPLES, SAMPLE_RATE};
use crate::provider::AudioFormat;
use stream::FragmentReader;

/// Decode failure: the payload was received but is unusable.
#[derive(Error, Debug)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

/// Whether a decode strategy is registered for `format`.
///
/// Checked before any network call; a requested format without a strategy
/// is a configuration error, not a candidate failure.
pub fn supported(format: AudioFormat) -> bool {
    matches!(format, AudioFormat::Wav | AudioFormat::Mp3 | AudioFormat::Opus)
}

/// Codec registry including the libopus adapter.
///
/// Opus is not shipped with symphonia's default codecs, so a process-wide
/// registry is built once with the adapter registered alongside the
/// decoders the default registry would carry.
fn get_codec_registry() -> &'static CodecRegistry {
    static CODEC_REGISTRY: OnceLock<CodecRegistry> = OnceLock::new();
    CODEC_REGISTRY.get_or_init(|| {
        let mut registry = CodecRegistry::new();
        registry.register_all::<OpusDecoder>();
        registry.register_all::<symphonia::default::codecs::MpaDecoder>();
        registry.register_all::<symphonia::default::codecs::PcmDecoder>();
        registry
    })
}

/// Probe hint for a declared format tag.
fn hint_for(format: AudioFormat) -> Hint {
    let mut hint = Hint::new();
    match format {
        AudioFormat::Wav => hint.with_extension("wav"),
        AudioFormat::Mp3 => hint.with_extension("mp3"),
        // Opus arrives in an ogg container.
        AudioFormat::Opus => hint.with_extension("ogg"),
    };
    hint
}

/// Decode a complete payload into chunked samples.
///
/// Blocking; run on a blocking thread.
pub fn decode_payload(
    payload: Vec<u8>,
    format: AudioFormat,
) -> Result<Vec<Vec<f32>>, DecodeError> {
    let mut chunks = Vec::new();
    let cursor = Cursor::new(payload);
    decode_source(Box::new(cursor), format, &mut |chunk| {
        chunks.push(chunk);
        true
    })?;
    Ok(chunks)
}

/// Decode a live fragment sequence, emitting each chunk as soon as it is
/// decoded.
///
/// Blocking; run on a blocking thread. `sink` returning `false` stops the
/// decode early (the downstream consumer has gone away), which is not an
/// error.
pub fn decode_fragments(
    reader: FragmentReader,
    format: AudioFormat,
    sink: &mut dyn FnMut(Vec<f32>) -> bool,
) -> Result<(), DecodeError> {
    decode_source(Box::new(ReadOnlySource::new(reader)), format, sink)
}

/// Shared decode loop: probe, select track, decode packets, downmix,
/// resample, chunk.
fn decode_source(
    source: Box<dyn MediaSource>,
    format: AudioFormat,
    sink: &mut dyn FnMut(Vec<f32>) -> bool,
) -> Result<(), DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());
    let hint = hint_for(format);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError(format!("{} probe failed: {}", format, e)))?;

    let mut reader = probed.format;
    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError(format!("no audio track in {} payload", format)))?;
    let track_id = track.id;

    let mut decoder = get_codec_registry()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError(format!("{} decoder init failed: {}", format, e)))?;

    // Carries partial chunks across packets.
    let mut chunk_buf: Vec<f32> = Vec::with_capacity(CHUNK_SAMPLES * 2);
    let mut total_samples: usize = 0;

    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(DecodeError(format!("{} packet read failed: {}", format, e)));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                warn!("Packet decode error (skipping): {}", e);
                continue;
            }
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let rate = spec.rate;
        let duration = decoded.capacity();
        let mut sample_buf = SampleBuffer::<f32>::new(duration as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let mono = to_mono(sample_buf.samples(), channels);
        let resampled = resample_linear(&mono, rate, SAMPLE_RATE);
        total_samples += resampled.len();

        chunk_buf.extend_from_slice(&resampled);
        while chunk_buf.len() >= CHUNK_SAMPLES {
            let chunk: Vec<f32> = chunk_buf.drain(..CHUNK_SAMPLES).collect();
            if !sink(chunk) {
                debug!("Chunk sink closed, stopping decode");
                return Ok(());
            }
        }
    }

    // Trailing partial chunk.
    if !chunk_buf.is_empty() {
        sink(std::mem::take(&mut chunk_buf));
    }

    if total_samples == 0 {
        return Err(DecodeError(format!("{} payload produced no audio", format)));
    }

    debug!(total_samples, %format, "Decode complete");
    Ok(())
}

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Simple linear resampler from `from_rate` to `to_rate`, mono f32.
///
/// Also used by the output device to adapt the pipeline rate to the
/// device's native rate.
pub(crate) fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode i16 samples as a 24 kHz mono WAV payload.
    fn wav_payload(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_all_formats_have_strategies() {
        assert!(supported(AudioFormat::Wav));
        assert!(supported(AudioFormat::Mp3));
        assert!(supported(AudioFormat::Opus));
    }

    #[test]
    fn test_wav_decode_preserves_sample_count_at_native_rate() {
        let samples: Vec<i16> = (0..48_000).map(|i| ((i % 100) * 300) as i16).collect();
        let payload = wav_payload(&samples, SAMPLE_RATE);

        let chunks = decode_payload(payload, AudioFormat::Wav).unwrap();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 48_000);

        // Every chunk except the trailing one is full-size.
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), CHUNK_SAMPLES);
        }
    }

    #[test]
    fn test_wav_decode_resamples_to_pipeline_rate() {
        let samples: Vec<i16> = vec![1000; 44_100];
        let payload = wav_payload(&samples, 44_100);

        let chunks = decode_payload(payload, AudioFormat::Wav).unwrap();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        // One second of source audio is roughly one second at 24 kHz.
        let expected = SAMPLE_RATE as usize;
        assert!(
            total.abs_diff(expected) < CHUNK_SAMPLES,
            "expected ~{} samples, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_malformed_payload_is_a_decode_error() {
        let garbage = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33];
        assert!(decode_payload(garbage, AudioFormat::Wav).is_err());
        assert!(decode_payload(vec![], AudioFormat::Mp3).is_err());
    }

    #[test]
    fn test_streaming_wav_decode_yields_chunks_incrementally() {
        let samples: Vec<i16> = vec![500; 10_000];
        let payload = wav_payload(&samples, SAMPLE_RATE);

        // Feed the payload in small fragments, as the network would.
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        for piece in payload.chunks(1024) {
            tx.blocking_send(piece.to_vec()).unwrap();
        }
        drop(tx);

        let mut total = 0usize;
        let mut chunk_count = 0usize;
        decode_fragments(FragmentReader::new(rx), AudioFormat::Wav, &mut |chunk| {
            total += chunk.len();
            chunk_count += 1;
            true
        })
        .unwrap();

        assert_eq!(total, 10_000);
        assert!(chunk_count >= 10_000 / CHUNK_SAMPLES);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_resample_identity_and_ratio() {
        let input: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        assert_eq!(resample_linear(&input, 24_000, 24_000).len(), 1000);
        let half = resample_linear(&input, 48_000, 24_000);
        assert_eq!(half.len(), 500);
    }
}
