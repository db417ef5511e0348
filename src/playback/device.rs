//! Output device interface.
//!
//! [`OutputDevice`] is the seam between the drain loop and the hardware:
//! `write` blocks until the chunk is accepted into the device buffer,
//! `stop` halts output immediately, `close` releases the device.
//! [`DeviceGuard`] guarantees stop/close run on every exit path.
//!
//! The production implementation drives cpal. The cpal stream is not
//! `Send`, so devices are constructed through a [`DeviceFactory`] on the
//! thread that will own them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use thiserror::Error;
use tracing::{error, info, warn};

use super::SAMPLE_RATE;
use crate::decode::resample_linear;

/// The output device rejected a write or failed to open.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct DeviceError(pub String);

/// Output device consumed by the playback drain loop.
pub trait OutputDevice {
    /// Block until `samples` (mono f32 at the pipeline rate) are accepted
    /// into the device buffer.
    fn write(&mut self, samples: &[f32]) -> Result<(), DeviceError>;

    /// Halt output immediately, discarding anything still buffered.
    fn stop(&mut self);

    /// Release the device. Lets naturally finished audio play out first.
    fn close(&mut self);
}

/// Constructs a device on the thread that will own it. The argument is
/// the session halt flag, observed inside blocking writes so cancellation
/// is not stuck behind a full device buffer.
pub type DeviceFactory =
    Arc<dyn Fn(Arc<AtomicBool>) -> Result<Box<dyn OutputDevice>, DeviceError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Scoped stop/close discipline
// ---------------------------------------------------------------------------

/// Wraps a device and guarantees `stop`/`close` on drop, whatever path
/// the drain loop exits through.
pub struct DeviceGuard {
    device: Option<Box<dyn OutputDevice>>,
    stopped: bool,
}

impl DeviceGuard {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device: Some(device),
            stopped: false,
        }
    }

    pub fn write(&mut self, samples: &[f32]) -> Result<(), DeviceError> {
        match self.device.as_mut() {
            Some(dev) => dev.write(samples),
            None => Err(DeviceError("device already closed".into())),
        }
    }

    /// Idempotent immediate stop.
    pub fn stop(&mut self) {
        if !self.stopped {
            if let Some(dev) = self.device.as_mut() {
                dev.stop();
            }
            self.stopped = true;
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(mut dev) = self.device.take() {
            dev.close();
        }
    }
}

// ---------------------------------------------------------------------------
// cpal device
// ---------------------------------------------------------------------------

/// Push-block sleep slice while the device ring is full.
const WRITE_POLL: Duration = Duration::from_millis(5);

/// Real output device backed by a cpal stream.
///
/// `write` resamples from the pipeline rate to the device's native rate,
/// fans mono out across the device channels, and pushes into a lock-free
/// sample ring. The real-time callback drains the ring and emits silence
/// when it runs dry.
pub struct CpalDevice {
    stream: Option<Stream>,
    prod: ringbuf::HeapProd<f32>,
    halt: Arc<AtomicBool>,
    flush: Arc<AtomicBool>,
    error_flag: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    device_rate: u32,
    channels: u16,
}

impl CpalDevice {
    /// Open the named (or default) output device.
    pub fn open(device_name: Option<&str>, halt: Arc<AtomicBool>) -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let found = host
                .output_devices()
                .map_err(|e| DeviceError(format!("failed to enumerate output devices: {}", e)))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false));
            match found {
                Some(dev) => {
                    info!(device = %name, "Using configured output device");
                    dev
                }
                None => {
                    warn!(device = %name, "Output device not found, falling back to default");
                    host.default_output_device()
                        .ok_or_else(|| DeviceError("no default output device".into()))?
                }
            }
        } else {
            host.default_output_device()
                .ok_or_else(|| DeviceError("no default output device".into()))?
        };

        let config = Self::find_f32_config(&device)?;
        let device_rate = config.sample_rate.0;
        let channels = config.channels;

        // ~250 ms of device-rate audio between write() and the callback.
        let capacity = (device_rate as usize / 4) * channels as usize;
        let rb = HeapRb::<f32>::new(capacity.max(1024));
        let (prod, mut cons) = rb.split();

        let flush = Arc::new(AtomicBool::new(false));
        let error_flag = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));

        let cb_flush = Arc::clone(&flush);
        let cb_active = Arc::clone(&active);
        let cb_underruns = Arc::clone(&underruns);
        let err_flag = Arc::clone(&error_flag);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    if cb_flush.load(Ordering::Acquire) {
                        while cons.try_pop().is_some() {}
                        data.fill(0.0);
                        return;
                    }
                    let n = cons.pop_slice(data);
                    if n < data.len() {
                        data[n..].fill(0.0);
                        // Silence before the first write is normal fill time.
                        if cb_active.load(Ordering::Acquire) {
                            cb_underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                },
                move |e| {
                    error!("Audio output stream error: {}", e);
                    err_flag.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| DeviceError(format!("failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| DeviceError(format!("failed to start output stream: {}", e)))?;

        info!(device_rate, channels, "Audio output started");

        Ok(Self {
            stream: Some(stream),
            prod,
            halt,
            flush,
            error_flag,
            active,
            underruns,
            device_rate,
            channels,
        })
    }

    /// Find an f32 output configuration, preferring the device default.
    fn find_f32_config(device: &cpal::Device) -> Result<StreamConfig, DeviceError> {
        let default = device
            .default_output_config()
            .map_err(|e| DeviceError(format!("failed to get output config: {}", e)))?;
        if default.sample_format() == SampleFormat::F32 {
            return Ok(default.config());
        }

        let supported = device
            .supported_output_configs()
            .map_err(|e| DeviceError(format!("failed to get output configs: {}", e)))?
            .find(|c| c.sample_format() == SampleFormat::F32)
            .ok_or_else(|| DeviceError("no f32 output configuration".into()))?;
        Ok(supported.with_max_sample_rate().config())
    }

    /// Underruns observed by the real-time callback.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl OutputDevice for CpalDevice {
    fn write(&mut self, samples: &[f32]) -> Result<(), DeviceError> {
        if self.error_flag.load(Ordering::Acquire) {
            return Err(DeviceError("output stream reported an error".into()));
        }
        if samples.is_empty() {
            return Ok(());
        }
        self.active.store(true, Ordering::Release);

        let at_rate = if self.device_rate == SAMPLE_RATE {
            samples.to_vec()
        } else {
            resample_linear(samples, SAMPLE_RATE, self.device_rate)
        };
        let interleaved: Vec<f32> = if self.channels <= 1 {
            at_rate
        } else {
            let ch = self.channels as usize;
            let mut out = Vec::with_capacity(at_rate.len() * ch);
            for s in at_rate {
                out.extend(std::iter::repeat(s).take(ch));
            }
            out
        };

        let mut offset = 0;
        while offset < interleaved.len() {
            // Session is halting; the rest of this chunk is moot.
            if self.halt.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.error_flag.load(Ordering::Acquire) {
                return Err(DeviceError("output stream reported an error".into()));
            }
            offset += self.prod.push_slice(&interleaved[offset..]);
            if offset < interleaved.len() {
                std::thread::sleep(WRITE_POLL);
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.flush.store(true, Ordering::Release);
        if let Some(stream) = &self.stream {
            let _ = stream.pause();
        }
    }

    fn close(&mut self) {
        // Natural completion: let buffered audio play out (bounded wait),
        // then halt the stream before releasing it.
        if !self.flush.load(Ordering::Acquire) {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while self.prod.occupied_len() > 0
                && !self.error_flag.load(Ordering::Acquire)
                && !self.halt.load(Ordering::Acquire)
                && std::time::Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        self.stop();
        self.stream.take();
    }
}
