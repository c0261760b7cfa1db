//! Position accounting for a single-producer/single-consumer circular buffer.
//!
//! The controller never touches sample data. It only tracks two free-running frame counters
//! and derives occupancy and wrapped indices from them. Counters are `u64` and are allowed to
//! wrap: occupancy is always computed as `write.wrapping_sub(read)`, which stays exact across
//! the wrap as long as the true occupancy fits in the counter width.
//!
//! Exactly one thread may advance the write counter and exactly one thread may advance the
//! read counter. Nothing here takes a lock.
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for the read/write counters of a [`RingBufferController`].
///
/// Implementations decide where the counters live (process-local atomics, a shared-memory
/// header, ...). Loads must have acquire semantics and stores release semantics so that sample
/// data written before a counter store is visible to the peer after it observes the counter.
pub trait FifoCounters {
    /// Current read counter.
    fn read_counter(&self) -> u64;
    /// Current write counter.
    fn write_counter(&self) -> u64;
    /// Publish a new read counter.
    fn store_read_counter(&self, value: u64);
    /// Publish a new write counter.
    fn store_write_counter(&self, value: u64);
}

/// Process-local counter pair.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    read: AtomicU64,
    write: AtomicU64,
}

impl AtomicCounters {
    /// Both counters start at `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            read: AtomicU64::new(start),
            write: AtomicU64::new(start),
        }
    }
}

impl FifoCounters for AtomicCounters {
    fn read_counter(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    fn write_counter(&self) -> u64 {
        self.write.load(Ordering::Acquire)
    }

    fn store_read_counter(&self, value: u64) {
        self.read.store(value, Ordering::Release);
    }

    fn store_write_counter(&self, value: u64) {
        self.write.store(value, Ordering::Release);
    }
}

/// Tracks read/write positions over a fixed-capacity circular region measured in frames.
///
/// `threshold_frames` is the logical size the producer may fill, always within
/// `[0, capacity_frames]`. Capacity does not need to be a power of two.
#[derive(Debug)]
pub struct RingBufferController<C: FifoCounters = AtomicCounters> {
    counters: C,
    capacity_frames: u64,
    threshold_frames: AtomicU64,
}

impl RingBufferController<AtomicCounters> {
    /// Controller with process-local counters reset to zero.
    pub fn new(capacity_frames: usize, threshold_frames: usize) -> Self {
        Self::with_counters(AtomicCounters::default(), capacity_frames, threshold_frames)
    }
}

impl<C: FifoCounters> RingBufferController<C> {
    /// Controller over an existing counter backend.
    pub fn with_counters(counters: C, capacity_frames: usize, threshold_frames: usize) -> Self {
        let capacity_frames = capacity_frames as u64;
        Self {
            counters,
            capacity_frames,
            threshold_frames: AtomicU64::new((threshold_frames as u64).min(capacity_frames)),
        }
    }

    /// Access the counter backend.
    pub fn counters(&self) -> &C {
        &self.counters
    }

    /// Fixed capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames as usize
    }

    /// Producer-visible logical size in frames.
    pub fn threshold_frames(&self) -> usize {
        self.threshold_frames.load(Ordering::Acquire) as usize
    }

    /// Clamp `threshold` into `[0, capacity]` and store it.
    pub fn set_threshold(&self, threshold: i64) {
        let clamped = threshold.clamp(0, self.capacity_frames as i64) as u64;
        self.threshold_frames.store(clamped, Ordering::Release);
    }

    /// Frames written but not yet read.
    pub fn available_to_read(&self) -> usize {
        let write = self.counters.write_counter();
        let read = self.counters.read_counter();
        write.wrapping_sub(read) as usize
    }

    /// Frames the producer may still write without exceeding the threshold.
    pub fn available_to_write(&self) -> usize {
        let threshold = self.threshold_frames();
        threshold.saturating_sub(self.available_to_read())
    }

    /// Consume `frames`. The caller must not exceed [`Self::available_to_read`].
    pub fn advance_read(&self, frames: usize) {
        let read = self.counters.read_counter();
        self.counters
            .store_read_counter(read.wrapping_add(frames as u64));
    }

    /// Publish `frames`. The caller must not exceed [`Self::available_to_write`].
    pub fn advance_write(&self, frames: usize) {
        let write = self.counters.write_counter();
        self.counters
            .store_write_counter(write.wrapping_add(frames as u64));
    }

    /// Frame index the consumer reads from next.
    pub fn read_index(&self) -> usize {
        self.wrap(self.counters.read_counter())
    }

    /// Frame index the producer writes to next.
    pub fn write_index(&self) -> usize {
        self.wrap(self.counters.write_counter())
    }

    /// Raw read counter, for diagnostics.
    pub fn read_counter(&self) -> u64 {
        self.counters.read_counter()
    }

    /// Raw write counter, for diagnostics.
    pub fn write_counter(&self) -> u64 {
        self.counters.write_counter()
    }

    fn wrap(&self, counter: u64) -> usize {
        if self.capacity_frames == 0 {
            return 0;
        }
        // Modulo rather than a mask: capacity may be any size.
        (counter % self.capacity_frames) as usize
    }
}
