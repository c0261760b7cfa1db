//! Contract for the one real stream an endpoint drives, plus a paced null sink.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{SampleFormat, StreamConfig};
use crate::tone::rms;

/// Errors reported by a hardware stream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The device went away; the stream cannot recover.
    #[error("hardware stream disconnected")]
    Disconnected,
    /// The requested configuration cannot be realized.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    /// A blocking operation did not complete in time.
    #[error("hardware operation timed out")]
    Timeout,
    /// Any other device failure.
    #[error("device error: {0}")]
    Device(String),
}

/// Parameters the hardware reports after a successful open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareParams {
    /// Actual frame rate.
    pub sample_rate: u32,
    /// Frames consumed per real-time transfer.
    pub frames_per_burst: usize,
    /// Bit mask of the opened channels.
    pub channel_mask: u32,
}

impl HardwareParams {
    /// Number of channels in [`Self::channel_mask`].
    pub fn channel_count(&self) -> usize {
        self.channel_mask.count_ones() as usize
    }
}

/// A single output stream on real (or simulated) hardware.
pub trait HardwareStream: Send {
    /// Open the stream for `config`.
    fn open(&mut self, config: &StreamConfig) -> Result<HardwareParams, HardwareError>;

    /// Blocking write of `frames` interleaved frames from `samples`. Returns frames accepted,
    /// which is fewer than `frames` if `timeout` expired first.
    fn write(
        &mut self,
        samples: &[f32],
        frames: usize,
        timeout: Duration,
    ) -> Result<usize, HardwareError>;

    /// Ask for a hardware buffer of `frames`; returns the size actually used.
    fn set_buffer_size(&mut self, frames: usize) -> usize {
        frames
    }

    /// Release the device.
    fn close(&mut self);
}

/// Creates hardware streams for new endpoints.
pub trait HardwareFactory: Send + Sync {
    /// Fresh, unopened stream for `config`.
    fn create(&self, config: &StreamConfig) -> Box<dyn HardwareStream>;
}

/// Mask with the low `channels` bits set.
pub fn channel_mask_for(channels: usize) -> u32 {
    if channels >= 32 {
        u32::MAX
    } else {
        (1u32 << channels) - 1
    }
}

/// Observable counters of a [`NullHardware`] sink.
#[derive(Debug, Default)]
pub struct NullHardwareProbe {
    frames_written: AtomicU64,
    last_rms_bits: AtomicU32,
    disconnect: AtomicBool,
}

impl NullHardwareProbe {
    /// Total frames accepted by the sink.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// RMS of the most recent burst.
    pub fn last_rms(&self) -> f32 {
        f32::from_bits(self.last_rms_bits.load(Ordering::Relaxed))
    }

    /// Make the next write report a disconnect.
    pub fn unplug(&self) {
        self.disconnect.store(true, Ordering::Release);
    }
}

/// Sink that discards audio at the pace a real device would consume it.
pub struct NullHardware {
    frames_per_burst: usize,
    sample_rate: u32,
    channels: usize,
    open: bool,
    next_deadline: Option<Instant>,
    probe: Arc<NullHardwareProbe>,
}

impl NullHardware {
    /// Burst size reported when the config leaves it open.
    pub const DEFAULT_FRAMES_PER_BURST: usize = 192;

    /// Unopened sink.
    pub fn new(probe: Arc<NullHardwareProbe>) -> Self {
        Self {
            frames_per_burst: Self::DEFAULT_FRAMES_PER_BURST,
            sample_rate: 0,
            channels: 0,
            open: false,
            next_deadline: None,
            probe,
        }
    }

    fn burst_period(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

impl HardwareStream for NullHardware {
    fn open(&mut self, config: &StreamConfig) -> Result<HardwareParams, HardwareError> {
        if !(8_000..=192_000).contains(&config.sample_rate) {
            return Err(HardwareError::Unsupported(format!(
                "sample rate {} Hz",
                config.sample_rate
            )));
        }
        if !(1..=8).contains(&config.channel_count) {
            return Err(HardwareError::Unsupported(format!(
                "{} channels",
                config.channel_count
            )));
        }
        if config.format == SampleFormat::I16 && config.channel_count > 2 {
            return Err(HardwareError::Unsupported(format!(
                "{:?} with {} channels",
                config.format, config.channel_count
            )));
        }
        self.sample_rate = config.sample_rate;
        self.channels = config.channel_count;
        self.frames_per_burst = config
            .frames_per_burst
            .filter(|frames| *frames > 0)
            .unwrap_or(Self::DEFAULT_FRAMES_PER_BURST);
        self.open = true;
        self.next_deadline = None;
        debug!(
            sample_rate = self.sample_rate,
            channels = self.channels,
            frames_per_burst = self.frames_per_burst,
            "null hardware opened"
        );
        Ok(HardwareParams {
            sample_rate: self.sample_rate,
            frames_per_burst: self.frames_per_burst,
            channel_mask: channel_mask_for(self.channels),
        })
    }

    fn write(
        &mut self,
        samples: &[f32],
        frames: usize,
        _timeout: Duration,
    ) -> Result<usize, HardwareError> {
        if !self.open {
            return Err(HardwareError::Device("stream not open".into()));
        }
        if self.probe.disconnect.swap(false, Ordering::AcqRel) {
            self.open = false;
            return Err(HardwareError::Disconnected);
        }

        let samples = &samples[..(frames * self.channels).min(samples.len())];
        self.probe
            .last_rms_bits
            .store(rms(samples).to_bits(), Ordering::Relaxed);
        self.probe
            .frames_written
            .fetch_add(frames as u64, Ordering::Relaxed);

        // Pace like a device clock: each burst occupies one period of wall time.
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now) + self.burst_period(frames);
        if deadline > now {
            std::thread::sleep(deadline - now);
            self.next_deadline = Some(deadline);
        } else {
            self.next_deadline = Some(now);
        }
        Ok(frames)
    }

    fn close(&mut self) {
        self.open = false;
        self.next_deadline = None;
    }
}

/// Factory handing out [`NullHardware`] sinks that all report into one probe.
#[derive(Default)]
pub struct NullHardwareFactory {
    probe: Arc<NullHardwareProbe>,
}

impl NullHardwareFactory {
    /// Factory with a fresh probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared probe for every sink created by this factory.
    pub fn probe(&self) -> Arc<NullHardwareProbe> {
        self.probe.clone()
    }
}

impl HardwareFactory for NullHardwareFactory {
    fn create(&self, _config: &StreamConfig) -> Box<dyn HardwareStream> {
        Box::new(NullHardware::new(self.probe.clone()))
    }
}
