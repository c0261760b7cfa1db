//! Configuration surface for endpoints and the streams they share.
use std::env;
use std::time::Duration;

use tracing::warn;

/// Environment variable overriding [`EndpointOptions::bursts_per_buffer`].
pub const MIXER_BURSTS_ENV: &str = "ENDPOINT_MIXER_BURSTS";

/// Bursts of hardware buffering used when nothing overrides it.
pub const BURSTS_PER_BUFFER_DEFAULT: usize = 2;

/// Sample encoding requested from the hardware. The engine itself always mixes in `f32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// 32-bit float.
    F32,
    /// Signed 16-bit integer.
    I16,
}

/// Hardware configuration requested by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frame rate in Hz.
    pub sample_rate: u32,
    /// Samples per frame.
    pub channel_count: usize,
    /// Hardware sample encoding.
    pub format: SampleFormat,
    /// Target device.
    pub device_id: u32,
    /// Preferred burst size; `None` lets the hardware pick.
    pub frames_per_burst: Option<usize>,
    /// Per-client ring capacity; `None` uses the endpoint default.
    pub capacity_frames: Option<usize>,
    /// Hardware buffer depth in bursts; `None` uses [`EndpointOptions::bursts_per_buffer`].
    pub bursts_per_buffer: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channel_count: 2,
            format: SampleFormat::F32,
            device_id: 0,
            frames_per_burst: None,
            capacity_frames: None,
            bursts_per_buffer: None,
        }
    }
}

impl StreamConfig {
    /// Whether an endpoint opened with `self` can serve a client asking for `requested`.
    ///
    /// Matching is exact; endpoints never down-mix or resample for a client.
    pub fn matches(&self, requested: &StreamConfig) -> bool {
        self.sample_rate == requested.sample_rate
            && self.channel_count == requested.channel_count
            && self.format == requested.format
            && self.device_id == requested.device_id
    }
}

/// Scheduling class for the endpoint's mixing thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Leave the thread at the default priority.
    Normal,
    /// Request real-time FIFO scheduling at the given priority (best effort).
    Realtime(i32),
}

/// Treatment of the mixed burst before it reaches the hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputLimiter {
    /// Pass the summed signal through untouched.
    #[default]
    Off,
    /// Clamp every sample into `[-1.0, 1.0]`.
    HardClip,
}

impl OutputLimiter {
    /// Apply the policy in place.
    pub fn apply(self, samples: &mut [f32]) {
        match self {
            OutputLimiter::Off => {}
            OutputLimiter::HardClip => {
                for sample in samples {
                    *sample = sample.clamp(-1.0, 1.0);
                }
            }
        }
    }
}

/// Policy knobs shared by every endpoint a registry opens.
#[derive(Clone, Debug)]
pub struct EndpointOptions {
    /// Hardware buffer depth in bursts.
    pub bursts_per_buffer: usize,
    /// Maximum client channels registered on one endpoint.
    pub max_channels: usize,
    /// Write timeout expressed in burst periods.
    pub timeout_bursts: u32,
    /// Lower bound on the write timeout.
    pub min_write_timeout: Duration,
    /// Scheduling class for the mixing thread.
    pub thread_priority: ThreadPriority,
    /// Output treatment before the hardware write.
    pub limiter: OutputLimiter,
    /// Default client ring capacity in bursts.
    pub channel_capacity_bursts: usize,
    /// Bursts over which volume changes are ramped.
    pub volume_ramp_bursts: u32,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            bursts_per_buffer: BURSTS_PER_BUFFER_DEFAULT,
            max_channels: 32,
            timeout_bursts: 4,
            min_write_timeout: Duration::from_secs(1),
            thread_priority: ThreadPriority::Realtime(80),
            limiter: OutputLimiter::Off,
            channel_capacity_bursts: 8,
            volume_ramp_bursts: 2,
        }
    }
}

impl EndpointOptions {
    /// Defaults, with `bursts_per_buffer` taken from [`MIXER_BURSTS_ENV`] when set to a
    /// positive integer.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = env::var(MIXER_BURSTS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(0) => {}
                Ok(bursts) => options.bursts_per_buffer = bursts,
                Err(err) => warn!(value = %raw, %err, "ignoring invalid {MIXER_BURSTS_ENV}"),
            }
        }
        options
    }

    /// Timeout for one blocking burst write.
    pub fn write_timeout(&self, frames_per_burst: usize, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return self.min_write_timeout;
        }
        let burst_nanos = frames_per_burst as u64 * 1_000_000_000 / sample_rate as u64;
        let scaled = Duration::from_nanos(burst_nanos.saturating_mul(self.timeout_bursts as u64));
        scaled.max(self.min_write_timeout)
    }
}
