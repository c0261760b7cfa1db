//! One hardware stream shared by many client channels.
//!
//! A [`ServiceEndpoint`] owns exactly one [`HardwareStream`]. While at least one registered
//! channel is running, a dedicated thread mixes a burst from every running channel and performs
//! a blocking write of that burst to the hardware. The channel list is the only state shared
//! between control calls and the mixing thread; its lock is never held across the hardware write.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelStatus, ClientChannel, StreamId};
use crate::config::{EndpointOptions, OutputLimiter, StreamConfig, ThreadPriority};
use crate::hardware::{HardwareError, HardwareParams, HardwareStream};
use crate::mixer::MixEngine;
use crate::priority::apply_thread_priority;
use crate::ring::monotonic_timestamp_ns;
use crate::tone::rms;
use crate::{EndpointError, push_log};

/// Whether an endpoint can still serve clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointHealth {
    /// Streaming normally or idle.
    Healthy = 0,
    /// The hardware reported a disconnect.
    Disconnected = 1,
    /// A hardware write failed for another reason.
    Faulted = 2,
}

impl EndpointHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EndpointHealth::Disconnected,
            2 => EndpointHealth::Faulted,
            _ => EndpointHealth::Healthy,
        }
    }
}

/// Why the mixing loop last ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// No channel was running any more, or the endpoint closed.
    Stopped,
    /// The hardware reported a disconnect.
    Disconnected,
    /// The hardware accepted fewer frames than a burst before timing out.
    ShortWrite {
        /// Frames accepted.
        written: usize,
        /// Frames offered.
        requested: usize,
    },
    /// The hardware write returned an error other than a disconnect.
    WriteFailed(String),
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Stopped => write!(f, "stopped"),
            LoopExit::Disconnected => write!(f, "disconnected"),
            LoopExit::ShortWrite { written, requested } => {
                write!(f, "short write {written}/{requested} frames")
            }
            LoopExit::WriteFailed(reason) => write!(f, "write failed: {reason}"),
        }
    }
}

/// Diagnostics snapshot for an endpoint.
#[derive(Clone, Debug)]
pub struct EndpointStatus {
    /// Device the endpoint drives.
    pub device_id: u32,
    /// Frame rate in Hz.
    pub sample_rate: u32,
    /// Samples per frame.
    pub channel_count: usize,
    /// Frames per hardware burst (0 while closed).
    pub frames_per_burst: usize,
    /// Hardware buffer size in frames (0 while closed).
    pub buffer_size_frames: usize,
    /// Clients holding the endpoint through a registry.
    pub reference_count: usize,
    /// Whether the endpoint is open.
    pub open: bool,
    /// Whether the mixing loop is active.
    pub streaming: bool,
    /// Endpoint health.
    pub health: EndpointHealth,
    /// Bursts delivered to the hardware since open.
    pub bursts_written: u64,
    /// Per-channel underflows summed since open.
    pub underflows: u64,
    /// RMS of the last burst written.
    pub output_rms: f32,
    /// Reason the mixing loop last ended, if it has.
    pub last_exit: Option<LoopExit>,
    /// Registered channels.
    pub channels: Vec<ChannelStatus>,
}

/// State shared with the mixing thread.
struct LoopShared {
    streams: Mutex<Vec<Arc<ClientChannel>>>,
    callback_enabled: AtomicBool,
    open: AtomicBool,
    health: AtomicU8,
    bursts_written: AtomicU64,
    underflows: AtomicU64,
    output_rms_bits: AtomicU32,
    last_exit: Mutex<Option<LoopExit>>,
}

impl LoopShared {
    fn health(&self) -> EndpointHealth {
        EndpointHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    fn set_health(&self, health: EndpointHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    fn running_count(&self) -> usize {
        self.streams.lock().iter().filter(|c| c.is_running()).count()
    }

    fn disconnect_registered_streams(&self) {
        for channel in self.streams.lock().iter() {
            channel.disconnect();
        }
    }

    fn fault_registered_streams(&self, reason: &str) {
        for channel in self.streams.lock().iter() {
            channel.fault(reason);
        }
    }
}

/// What the mixing thread owns while it runs and hands back when it stops.
struct LoopResources {
    hardware: Box<dyn HardwareStream>,
    mixer: MixEngine,
}

/// Fixed inputs of one mixing loop run.
struct LoopParams {
    frames_per_burst: usize,
    timeout: Duration,
    limiter: OutputLimiter,
    priority: ThreadPriority,
}

struct Control {
    resources: Option<LoopResources>,
    hardware: Option<Box<dyn HardwareStream>>,
    thread: Option<JoinHandle<Option<LoopResources>>>,
    params: Option<HardwareParams>,
    buffer_size_frames: usize,
}

/// Fan-in of many client channels onto one hardware stream.
pub struct ServiceEndpoint {
    config: StreamConfig,
    options: EndpointOptions,
    control: Mutex<Control>,
    shared: Arc<LoopShared>,
    reference_count: AtomicUsize,
}

impl ServiceEndpoint {
    /// Closed endpoint that will drive `hardware` once opened.
    pub fn new(
        config: StreamConfig,
        options: EndpointOptions,
        hardware: Box<dyn HardwareStream>,
    ) -> Self {
        Self {
            config,
            options,
            control: Mutex::new(Control {
                resources: None,
                hardware: Some(hardware),
                thread: None,
                params: None,
                buffer_size_frames: 0,
            }),
            shared: Arc::new(LoopShared {
                streams: Mutex::new(Vec::new()),
                callback_enabled: AtomicBool::new(false),
                open: AtomicBool::new(false),
                health: AtomicU8::new(EndpointHealth::Healthy as u8),
                bursts_written: AtomicU64::new(0),
                underflows: AtomicU64::new(0),
                output_rms_bits: AtomicU32::new(0),
                last_exit: Mutex::new(None),
            }),
            reference_count: AtomicUsize::new(0),
        }
    }

    /// Open the hardware stream and size the mixer from what it reports.
    pub fn open(&self) -> Result<(), EndpointError> {
        let mut control = self.control.lock();
        if self.shared.open.load(Ordering::Acquire) {
            return Err(EndpointError::AlreadyOpen);
        }
        let mut hardware = control.hardware.take().ok_or_else(|| {
            EndpointError::Hardware(HardwareError::Device("hardware stream lost".into()))
        })?;

        let params = match hardware.open(&self.config) {
            Ok(params) => params,
            Err(err) => {
                control.hardware = Some(hardware);
                return Err(match err {
                    HardwareError::Unsupported(reason) => {
                        EndpointError::ConfigurationUnsupported(reason)
                    }
                    other => EndpointError::Hardware(other),
                });
            }
        };

        if let Err(reason) = self.validate_params(&params) {
            hardware.close();
            control.hardware = Some(hardware);
            return Err(EndpointError::ConfigurationUnsupported(reason));
        }

        let bursts_per_buffer = self
            .config
            .bursts_per_buffer
            .filter(|bursts| *bursts > 0)
            .unwrap_or(self.options.bursts_per_buffer)
            .max(1);
        let desired = bursts_per_buffer * params.frames_per_burst;
        let buffer_size_frames = hardware.set_buffer_size(desired);

        control.resources = Some(LoopResources {
            hardware,
            mixer: MixEngine::new(self.config.channel_count, params.frames_per_burst),
        });
        control.params = Some(params);
        control.buffer_size_frames = buffer_size_frames;

        self.shared.set_health(EndpointHealth::Healthy);
        self.shared.bursts_written.store(0, Ordering::Relaxed);
        self.shared.underflows.store(0, Ordering::Relaxed);
        *self.shared.last_exit.lock() = None;
        self.shared.open.store(true, Ordering::Release);

        info!(
            device = self.config.device_id,
            sample_rate = params.sample_rate,
            frames_per_burst = params.frames_per_burst,
            buffer_size_frames,
            "endpoint opened"
        );
        push_log(format!(
            "endpoint {} opened: {} Hz, {} frames/burst",
            self.config.device_id, params.sample_rate, params.frames_per_burst
        ));
        Ok(())
    }

    fn validate_params(&self, params: &HardwareParams) -> Result<(), String> {
        if params.frames_per_burst == 0 {
            return Err("hardware reported an empty burst".into());
        }
        if params.sample_rate != self.config.sample_rate {
            return Err(format!(
                "hardware opened at {} Hz, requested {} Hz",
                params.sample_rate, self.config.sample_rate
            ));
        }
        if params.channel_count() != self.config.channel_count {
            return Err(format!(
                "hardware opened {} channels, requested {}",
                params.channel_count(),
                self.config.channel_count
            ));
        }
        Ok(())
    }

    /// Stop streaming, close the hardware and drop every registration.
    pub fn close(&self) -> Result<(), EndpointError> {
        let mut control = self.control.lock();
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(EndpointError::NotOpen);
        }
        self.stop_loop_locked(&mut control);

        if let Some(LoopResources { mut hardware, .. }) = control.resources.take() {
            hardware.close();
            control.hardware = Some(hardware);
        }
        control.params = None;
        control.buffer_size_frames = 0;

        let orphaned: Vec<Arc<ClientChannel>> = self.shared.streams.lock().drain(..).collect();
        for channel in &orphaned {
            channel.mark_stopped();
        }
        self.shared.open.store(false, Ordering::Release);

        info!(
            device = self.config.device_id,
            orphaned = orphaned.len(),
            "endpoint closed"
        );
        push_log(format!("endpoint {} closed", self.config.device_id));
        Ok(())
    }

    /// Whether [`Self::open`] succeeded and [`Self::close`] has not run since.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), EndpointError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EndpointError::NotOpen)
        }
    }

    fn ensure_healthy(&self) -> Result<(), EndpointError> {
        match self.shared.health() {
            EndpointHealth::Healthy => Ok(()),
            EndpointHealth::Disconnected => Err(EndpointError::Disconnected),
            EndpointHealth::Faulted => Err(EndpointError::StreamFault(
                self.last_exit()
                    .map(|exit| exit.to_string())
                    .unwrap_or_else(|| "endpoint faulted".into()),
            )),
        }
    }

    /// Build a channel sized for this endpoint. It still has to be registered.
    pub fn create_channel(&self) -> Result<Arc<ClientChannel>, EndpointError> {
        let control = self.control.lock();
        let params = control.params.ok_or(EndpointError::NotOpen)?;
        let default_capacity = self.options.channel_capacity_bursts * params.frames_per_burst;
        let capacity = self
            .config
            .capacity_frames
            .unwrap_or(default_capacity)
            .max(control.buffer_size_frames);
        let id = StreamId::next();
        Ok(Arc::new(ClientChannel::new(
            id,
            capacity,
            self.config.channel_count,
        )))
    }

    /// Add `channel` to the set this endpoint mixes. Registering twice is a no-op.
    pub fn register_stream(&self, channel: Arc<ClientChannel>) -> Result<(), EndpointError> {
        self.ensure_open()?;
        if channel.channel_count() != self.config.channel_count {
            return Err(EndpointError::ChannelMismatch {
                expected: self.config.channel_count,
                actual: channel.channel_count(),
            });
        }
        let mut streams = self.shared.streams.lock();
        if streams.iter().any(|c| c.id() == channel.id()) {
            return Ok(());
        }
        if streams.len() >= self.options.max_channels {
            return Err(EndpointError::CapacityExceeded(self.options.max_channels));
        }
        debug!(stream = %channel.id(), registered = streams.len() + 1, "stream registered");
        streams.push(channel);
        Ok(())
    }

    /// Remove a channel. Unknown ids are ignored.
    pub fn unregister_stream(&self, id: StreamId) -> Result<(), EndpointError> {
        let mut control = self.control.lock();
        let removed = {
            let mut streams = self.shared.streams.lock();
            streams
                .iter()
                .position(|c| c.id() == id)
                .map(|pos| streams.remove(pos))
        };
        let Some(channel) = removed else {
            return Ok(());
        };
        debug!(stream = %id, "stream unregistered");
        if channel.mark_stopped() && self.shared.running_count() == 0 {
            self.stop_loop_locked(&mut control);
        }
        Ok(())
    }

    fn find_stream(&self, id: StreamId) -> Result<Arc<ClientChannel>, EndpointError> {
        self.shared
            .streams
            .lock()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or(EndpointError::UnknownStream(id))
    }

    /// Mark a registered channel running and make sure the mixing loop is active.
    pub fn start_stream(&self, id: StreamId) -> Result<(), EndpointError> {
        self.ensure_open()?;
        self.ensure_healthy()?;
        let channel = self.find_stream(id)?;
        channel.mark_running()?;

        let mut control = self.control.lock();
        if let Err(err) = self.start_loop_locked(&mut control) {
            channel.mark_stopped();
            return Err(err);
        }
        Ok(())
    }

    /// Take a channel out of the mix; the loop idles once nothing is running.
    pub fn stop_stream(&self, id: StreamId) -> Result<(), EndpointError> {
        self.ensure_open()?;
        let channel = self.find_stream(id)?;
        let mut control = self.control.lock();
        if channel.mark_stopped() && self.shared.running_count() == 0 {
            self.stop_loop_locked(&mut control);
        }
        Ok(())
    }

    /// Change a channel's volume, ramped over the configured number of bursts.
    pub fn set_stream_volume(&self, id: StreamId, volume: f32) -> Result<(), EndpointError> {
        let channel = self.find_stream(id)?;
        channel.set_volume(volume, self.options.volume_ramp_bursts);
        Ok(())
    }

    /// Mark every registered channel disconnected.
    pub fn disconnect_registered_streams(&self) {
        self.shared.disconnect_registered_streams();
    }

    fn start_loop_locked(&self, control: &mut Control) -> Result<(), EndpointError> {
        if let Some(handle) = control.thread.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
            // The loop ended on its own; reclaim the hardware before deciding anything.
            self.join_loop_locked(control);
            self.ensure_healthy()?;
        }
        let params = control.params.ok_or(EndpointError::NotOpen)?;
        let resources = control.resources.take().ok_or_else(|| {
            EndpointError::Hardware(HardwareError::Device("hardware stream lost".into()))
        })?;

        let loop_params = LoopParams {
            frames_per_burst: params.frames_per_burst,
            timeout: self
                .options
                .write_timeout(params.frames_per_burst, params.sample_rate),
            limiter: self.options.limiter,
            priority: self.options.thread_priority,
        };

        // Resources travel over a channel so a failed spawn leaves them with us.
        let (handoff_tx, handoff_rx) = crossbeam_channel::bounded::<LoopResources>(1);
        let shared = self.shared.clone();
        self.shared.callback_enabled.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(format!(
                "endpoint-{}-{}",
                self.config.device_id, self.config.sample_rate
            ))
            .spawn(move || {
                let mut resources = handoff_rx.recv().ok()?;
                callback_loop(&shared, &mut resources, &loop_params);
                Some(resources)
            });

        match spawned {
            Ok(handle) => {
                if let Err(err) = handoff_tx.send(resources) {
                    // Unreachable in practice: the receiver lives in the new thread.
                    control.resources = Some(err.into_inner());
                }
                control.thread = Some(handle);
                push_log(format!("endpoint {} streaming", self.config.device_id));
                Ok(())
            }
            Err(err) => {
                self.shared.callback_enabled.store(false, Ordering::Release);
                control.resources = Some(resources);
                error!(%err, "failed to spawn mixing thread");
                Err(EndpointError::Spawn(err))
            }
        }
    }

    fn stop_loop_locked(&self, control: &mut Control) {
        self.shared.callback_enabled.store(false, Ordering::Release);
        if control.thread.is_some() {
            self.join_loop_locked(control);
            push_log(format!("endpoint {} idle", self.config.device_id));
        }
    }

    fn join_loop_locked(&self, control: &mut Control) {
        let Some(handle) = control.thread.take() else {
            return;
        };
        match handle.join() {
            Ok(Some(resources)) => control.resources = Some(resources),
            Ok(None) | Err(_) => {
                error!(device = self.config.device_id, "mixing thread panicked");
                self.shared
                    .fault_registered_streams("mixing thread panicked");
                self.shared.set_health(EndpointHealth::Faulted);
                *self.shared.last_exit.lock() =
                    Some(LoopExit::WriteFailed("mixing thread panicked".into()));
            }
        }
    }

    /// Requested configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Frames per hardware burst, once open.
    pub fn frames_per_burst(&self) -> Option<usize> {
        self.control.lock().params.map(|p| p.frames_per_burst)
    }

    /// Hardware buffer size in frames, once open.
    pub fn buffer_size_frames(&self) -> Option<usize> {
        let control = self.control.lock();
        control.params.map(|_| control.buffer_size_frames)
    }

    /// Whether the mixing loop is active.
    pub fn is_streaming(&self) -> bool {
        self.shared.callback_enabled.load(Ordering::Acquire)
    }

    /// Current health.
    pub fn health(&self) -> EndpointHealth {
        self.shared.health()
    }

    /// Whether the registry may hand this endpoint to new clients.
    pub fn is_usable(&self) -> bool {
        self.is_open() && self.health() == EndpointHealth::Healthy
    }

    /// Reason the mixing loop last ended.
    pub fn last_exit(&self) -> Option<LoopExit> {
        self.shared.last_exit.lock().clone()
    }

    /// Registered channel ids in registration order.
    pub fn registered_streams(&self) -> Vec<StreamId> {
        self.shared.streams.lock().iter().map(|c| c.id()).collect()
    }

    /// Clients holding this endpoint through a registry.
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_reference_count(&self, count: usize) {
        self.reference_count.store(count, Ordering::Release);
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> EndpointStatus {
        let (frames_per_burst, buffer_size_frames) = {
            let control = self.control.lock();
            (
                control.params.map(|p| p.frames_per_burst).unwrap_or(0),
                control.buffer_size_frames,
            )
        };
        let channels = self
            .shared
            .streams
            .lock()
            .iter()
            .map(|c| c.status())
            .collect();
        EndpointStatus {
            device_id: self.config.device_id,
            sample_rate: self.config.sample_rate,
            channel_count: self.config.channel_count,
            frames_per_burst,
            buffer_size_frames,
            reference_count: self.reference_count(),
            open: self.is_open(),
            streaming: self.is_streaming(),
            health: self.health(),
            bursts_written: self.shared.bursts_written.load(Ordering::Relaxed),
            underflows: self.shared.underflows.load(Ordering::Relaxed),
            output_rms: f32::from_bits(self.shared.output_rms_bits.load(Ordering::Relaxed)),
            last_exit: self.last_exit(),
            channels,
        }
    }
}

impl Drop for ServiceEndpoint {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .field("health", &self.health())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// Mix every running channel and write one burst per iteration until disabled or the
/// hardware fails.
fn callback_loop(shared: &LoopShared, resources: &mut LoopResources, params: &LoopParams) {
    apply_thread_priority(params.priority);
    let LoopResources { hardware, mixer } = resources;
    let frames_per_burst = params.frames_per_burst;
    let mut underflow_count = 0u64;

    let exit = loop {
        if !shared.callback_enabled.load(Ordering::Acquire) {
            break LoopExit::Stopped;
        }

        mixer.clear();
        {
            let streams = shared.streams.lock();
            for (index, channel) in streams.iter().enumerate() {
                if !channel.is_running() {
                    continue;
                }
                let volume = channel.next_burst_volume();
                let (frames, underflowed) = mixer.accumulate(channel.ring(), volume);
                if underflowed {
                    underflow_count += 1;
                    shared.underflows.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(index, stream = %channel.id(), frames, "underflow");
                }
                channel.record_transfer(monotonic_timestamp_ns(), frames, underflowed);
            }
        }
        params.limiter.apply(mixer.output_buffer_mut());

        match hardware.write(mixer.output_buffer(), frames_per_burst, params.timeout) {
            Ok(written) if written == frames_per_burst => {
                shared.bursts_written.fetch_add(1, Ordering::Relaxed);
                shared
                    .output_rms_bits
                    .store(rms(mixer.output_buffer()).to_bits(), Ordering::Relaxed);
            }
            Ok(written) => {
                warn!(written, requested = frames_per_burst, "callback loop short write");
                break LoopExit::ShortWrite {
                    written,
                    requested: frames_per_burst,
                };
            }
            Err(HardwareError::Disconnected) => break LoopExit::Disconnected,
            Err(err) => {
                warn!(%err, "callback loop write failed");
                break LoopExit::WriteFailed(err.to_string());
            }
        }
    };

    shared.callback_enabled.store(false, Ordering::Release);
    if underflow_count > 0 {
        warn!(underflow_count, "callback loop had underflows");
    }

    debug!(exit = %exit, "callback loop exited");

    // Channels first, then health, then the exit reason: observers of a later step can rely on
    // the earlier ones having happened.
    match &exit {
        LoopExit::Stopped => {}
        LoopExit::Disconnected => {
            shared.disconnect_registered_streams();
            shared.set_health(EndpointHealth::Disconnected);
            push_log("hardware disconnected, streams notified");
        }
        fault => {
            let reason = fault.to_string();
            shared.fault_registered_streams(&reason);
            shared.set_health(EndpointHealth::Faulted);
            push_log(format!("endpoint faulted: {reason}"));
        }
    }
    *shared.last_exit.lock() = Some(exit);
}
