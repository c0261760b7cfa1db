//! Per-client stream state: the client's ring buffer plus run state, volume and diagnostics.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::debug;

use crate::EndpointError;
use crate::ring::SharedRingBuffer;

const EVENT_BACKLOG: usize = 64;

/// Opaque identity of a client stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);

impl StreamId {
    /// Process-unique id.
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Lifecycle of a client channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Registered but not contributing to the mix.
    Stopped = 0,
    /// Mixed every burst.
    Running = 1,
    /// The hardware went away. Terminal.
    Disconnected = 2,
    /// The endpoint hit a fatal write failure. Terminal.
    Faulted = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Running,
            2 => ChannelState::Disconnected,
            3 => ChannelState::Faulted,
            _ => ChannelState::Stopped,
        }
    }

    /// Whether the channel can never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Disconnected | ChannelState::Faulted)
    }
}

/// Notifications delivered to whoever owns the client side of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The channel joined the mix.
    Started,
    /// The channel left the mix.
    Stopped,
    /// The hardware stream was lost.
    Disconnected,
    /// The endpoint stopped after a fatal write failure.
    Faulted(String),
}

/// Linear gain that moves toward a target in equal per-burst steps.
///
/// The mixer takes exactly one value per burst, so a ramp is piecewise constant across a burst.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeRamp {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
}

impl VolumeRamp {
    /// Settled at `volume`.
    pub fn new(volume: f32) -> Self {
        let volume = volume.max(0.0);
        Self {
            current: volume,
            target: volume,
            step: 0.0,
            remaining: 0,
        }
    }

    /// Start moving to `target` over `bursts` bursts; zero jumps immediately.
    pub fn set_target(&mut self, target: f32, bursts: u32) {
        let target = target.max(0.0);
        self.target = target;
        if bursts == 0 {
            self.current = target;
            self.step = 0.0;
            self.remaining = 0;
        } else {
            self.step = (target - self.current) / bursts as f32;
            self.remaining = bursts;
        }
    }

    /// Value for the next burst.
    pub fn next_value(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    /// Current value without advancing.
    pub fn current(&self) -> f32 {
        self.current
    }

    /// Where the ramp ends.
    pub fn target(&self) -> f32 {
        self.target
    }
}

/// Diagnostics snapshot for one channel.
#[derive(Clone, Debug)]
pub struct ChannelStatus {
    /// Channel identity.
    pub id: StreamId,
    /// Lifecycle state.
    pub state: ChannelState,
    /// Target linear volume.
    pub volume: f32,
    /// Queued frames relative to the ring threshold (0-1).
    pub buffer_fill: f32,
    /// Bursts in which the channel had too few frames.
    pub underflows: u64,
    /// Frames consumed by the mixer.
    pub frames_mixed: u64,
    /// Time of the last mixer transfer.
    pub last_transfer_ns: u64,
}

/// One client's stream as seen by an endpoint.
///
/// The client produces into [`Self::ring`]; the endpoint's mixing thread consumes from it.
pub struct ClientChannel {
    id: StreamId,
    ring: Arc<SharedRingBuffer>,
    state: AtomicU8,
    volume: Mutex<VolumeRamp>,
    target_volume_bits: AtomicU32,
    applied_volume_bits: AtomicU32,
    last_transfer_ns: AtomicU64,
    underflows: AtomicU64,
    frames_mixed: AtomicU64,
    events_tx: Sender<StreamEvent>,
    events_rx: Receiver<StreamEvent>,
}

impl ClientChannel {
    /// Channel over a fresh heap ring buffer.
    pub fn new(id: StreamId, capacity_frames: usize, channels: usize) -> Self {
        Self::with_ring(id, Arc::new(SharedRingBuffer::new_local(capacity_frames, channels)))
    }

    /// Channel over a ring supplied by the client transport.
    pub fn with_ring(id: StreamId, ring: Arc<SharedRingBuffer>) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_BACKLOG);
        Self {
            id,
            ring,
            state: AtomicU8::new(ChannelState::Stopped as u8),
            volume: Mutex::new(VolumeRamp::new(1.0)),
            target_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            applied_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            last_transfer_ns: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            frames_mixed: AtomicU64::new(0),
            events_tx,
            events_rx,
        }
    }

    /// Channel identity.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The client's ring buffer.
    pub fn ring(&self) -> &Arc<SharedRingBuffer> {
        &self.ring
    }

    /// Samples per frame.
    pub fn channel_count(&self) -> usize {
        self.ring.channels()
    }

    /// Producer side: queue interleaved samples, returning frames accepted.
    pub fn write(&self, samples: &[f32]) -> usize {
        self.ring.push(samples, None)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the mixer should pull from this channel.
    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running
    }

    /// Receiver for this channel's lifecycle events.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.events_rx.clone()
    }

    fn notify(&self, event: StreamEvent) {
        // Never blocks; when nobody drains the queue the newest events are dropped.
        let _ = self.events_tx.try_send(event);
    }

    /// Move from stopped to running. Returns `true` if the state changed.
    pub(crate) fn mark_running(&self) -> Result<bool, EndpointError> {
        match self.state.compare_exchange(
            ChannelState::Stopped as u8,
            ChannelState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.notify(StreamEvent::Started);
                Ok(true)
            }
            Err(current) => match ChannelState::from_u8(current) {
                ChannelState::Running => Ok(false),
                ChannelState::Disconnected => Err(EndpointError::Disconnected),
                ChannelState::Faulted => Err(EndpointError::StreamFault(format!(
                    "{} faulted earlier",
                    self.id
                ))),
                ChannelState::Stopped => Ok(false),
            },
        }
    }

    /// Move from running to stopped. Returns `true` if the state changed.
    pub(crate) fn mark_stopped(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(
                ChannelState::Running as u8,
                ChannelState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if changed {
            self.notify(StreamEvent::Stopped);
        }
        changed
    }

    fn enter_terminal(&self, terminal: ChannelState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!ChannelState::from_u8(current).is_terminal()).then_some(terminal as u8)
            })
            .is_ok()
    }

    /// Enter the terminal disconnected state and tell the client.
    pub fn disconnect(&self) {
        if self.enter_terminal(ChannelState::Disconnected) {
            debug!(stream = %self.id, "channel disconnected");
            self.notify(StreamEvent::Disconnected);
        }
    }

    /// Enter the terminal faulted state and tell the client. The first terminal state wins.
    pub fn fault(&self, reason: &str) {
        if self.enter_terminal(ChannelState::Faulted) {
            debug!(stream = %self.id, reason, "channel faulted");
            self.notify(StreamEvent::Faulted(reason.to_string()));
        }
    }

    /// Set the target linear volume, ramped over `ramp_bursts` bursts.
    pub fn set_volume(&self, volume: f32, ramp_bursts: u32) {
        let volume = volume.max(0.0);
        self.volume.lock().set_target(volume, ramp_bursts);
        self.target_volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Target linear volume.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.target_volume_bits.load(Ordering::Relaxed))
    }

    /// Scalar the mixer applies for the coming burst.
    pub(crate) fn next_burst_volume(&self) -> f32 {
        match self.volume.try_lock() {
            Some(mut ramp) => {
                let value = ramp.next_value();
                self.applied_volume_bits
                    .store(value.to_bits(), Ordering::Relaxed);
                value
            }
            // A control thread is mid-update; hold the previous burst's value.
            None => self.applied_volume(),
        }
    }

    /// Scalar the mixer applied to the most recent burst.
    pub fn applied_volume(&self) -> f32 {
        f32::from_bits(self.applied_volume_bits.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn lock_volume_for_test(&self) -> parking_lot::MutexGuard<'_, VolumeRamp> {
        self.volume.lock()
    }

    pub(crate) fn record_transfer(&self, timestamp_ns: u64, frames: usize, underflowed: bool) {
        self.last_transfer_ns.store(timestamp_ns, Ordering::Relaxed);
        self.frames_mixed.fetch_add(frames as u64, Ordering::Relaxed);
        if underflowed {
            self.underflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time of the last mixer transfer.
    pub fn last_transfer_ns(&self) -> u64 {
        self.last_transfer_ns.load(Ordering::Relaxed)
    }

    /// Bursts in which this channel underflowed.
    pub fn underflow_count(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            id: self.id,
            state: self.state(),
            volume: self.volume(),
            buffer_fill: self.ring.fill_ratio(),
            underflows: self.underflow_count(),
            frames_mixed: self.frames_mixed.load(Ordering::Relaxed),
            last_transfer_ns: self.last_transfer_ns(),
        }
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("channels", &self.channel_count())
            .field("capacity_frames", &self.ring.capacity_frames())
            .finish()
    }
}
