//! Shared-memory friendly single-producer/single-consumer frame buffer.
//!
//! Sample storage lives either on the local heap or in a `memmap2` mapping that starts with a
//! [`RingBufferHeader`]. Position accounting is delegated to a
//! [`RingBufferController`](crate::fifo::RingBufferController) whose counters live in that header,
//! so peer processes see the same occupancy without calling into Rust.
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

use crate::fifo::{AtomicCounters, FifoCounters, RingBufferController};

/// Header stored at the front of a mapped buffer so that peer processes can
/// inspect queue state.
#[repr(C, align(64))]
pub struct RingBufferHeader {
    capacity_frames: u32,
    channels: u32,
    reserved: u64,
    read_counter: AtomicU64,
    write_counter: AtomicU64,
    last_timestamp_ns: AtomicU64,
}

impl RingBufferHeader {
    fn new(capacity_frames: usize, channels: usize) -> Self {
        Self {
            capacity_frames: capacity_frames as u32,
            channels: channels as u32,
            reserved: 0,
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            last_timestamp_ns: AtomicU64::new(0),
        }
    }
}

/// Counters read through a pointer into a mapped header.
pub struct MappedCounters {
    header: NonNull<RingBufferHeader>,
}

// The header is only accessed through atomics.
unsafe impl Send for MappedCounters {}
unsafe impl Sync for MappedCounters {}

impl MappedCounters {
    fn header(&self) -> &RingBufferHeader {
        unsafe { self.header.as_ref() }
    }
}

/// Counter backend used by [`SharedRingBuffer`].
pub enum RingCounters {
    /// Counters on the local heap.
    Local(AtomicCounters),
    /// Counters inside a mapped [`RingBufferHeader`].
    Mapped(MappedCounters),
}

impl FifoCounters for RingCounters {
    fn read_counter(&self) -> u64 {
        match self {
            RingCounters::Local(c) => c.read_counter(),
            RingCounters::Mapped(m) => m.header().read_counter.load(Ordering::Acquire),
        }
    }

    fn write_counter(&self) -> u64 {
        match self {
            RingCounters::Local(c) => c.write_counter(),
            RingCounters::Mapped(m) => m.header().write_counter.load(Ordering::Acquire),
        }
    }

    fn store_read_counter(&self, value: u64) {
        match self {
            RingCounters::Local(c) => c.store_read_counter(value),
            RingCounters::Mapped(m) => m.header().read_counter.store(value, Ordering::Release),
        }
    }

    fn store_write_counter(&self, value: u64) {
        match self {
            RingCounters::Local(c) => c.store_write_counter(value),
            RingCounters::Mapped(m) => m.header().write_counter.store(value, Ordering::Release),
        }
    }
}

enum RingStorage {
    Local(Vec<f32>),
    Mapped(MmapMut),
}

/// Lock-free ring buffer of interleaved `f32` frames.
pub struct SharedRingBuffer {
    controller: RingBufferController<RingCounters>,
    _storage: RingStorage,
    data_ptr: *mut f32,
    channels: usize,
    local_timestamp_ns: AtomicU64,
}

// Producer and consumer touch disjoint regions, coordinated by the controller's counters.
unsafe impl Send for SharedRingBuffer {}
unsafe impl Sync for SharedRingBuffer {}

impl SharedRingBuffer {
    /// Create a heap-backed ring buffer. The threshold starts at full capacity.
    pub fn new_local(capacity_frames: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        let mut data = vec![0.0f32; capacity_frames * channels];
        let data_ptr = data.as_mut_ptr();
        Self {
            controller: RingBufferController::with_counters(
                RingCounters::Local(AtomicCounters::default()),
                capacity_frames,
                capacity_frames,
            ),
            _storage: RingStorage::Local(data),
            data_ptr,
            channels,
            local_timestamp_ns: AtomicU64::new(0),
        }
    }

    /// Create a ring buffer in an anonymous shared mapping.
    pub fn new_shared(capacity_frames: usize, channels: usize) -> io::Result<Self> {
        let channels = channels.max(1);
        let bytes = size_of::<RingBufferHeader>() + size_of::<f32>() * capacity_frames * channels;
        let mut mmap = MmapOptions::new().len(bytes).map_anon()?;
        let header_ptr = mmap.as_mut_ptr() as *mut RingBufferHeader;
        unsafe {
            header_ptr.write(RingBufferHeader::new(capacity_frames, channels));
        }
        Self::from_mmap(mmap)
    }

    /// Attach to an existing mapping that follows the header + data layout.
    pub fn from_mmap(mut mmap: MmapMut) -> io::Result<Self> {
        if mmap.len() < size_of::<RingBufferHeader>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "mapping smaller than ring header",
            ));
        }
        let header_ptr = mmap.as_mut_ptr() as *mut RingBufferHeader;
        let (capacity_frames, channels) = unsafe {
            (
                (*header_ptr).capacity_frames as usize,
                (*header_ptr).channels as usize,
            )
        };
        let needed = size_of::<RingBufferHeader>() + size_of::<f32>() * capacity_frames * channels;
        if channels == 0 || mmap.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "mapping of {} bytes cannot hold {capacity_frames} frames x {channels} channels",
                    mmap.len()
                ),
            ));
        }
        let data_ptr = unsafe { mmap.as_mut_ptr().add(size_of::<RingBufferHeader>()) as *mut f32 };
        let header = NonNull::new(header_ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "null mapping address")
        })?;
        Ok(Self {
            controller: RingBufferController::with_counters(
                RingCounters::Mapped(MappedCounters { header }),
                capacity_frames,
                capacity_frames,
            ),
            _storage: RingStorage::Mapped(mmap),
            data_ptr,
            channels,
            local_timestamp_ns: AtomicU64::new(0),
        })
    }

    /// Position accounting for this buffer.
    pub fn controller(&self) -> &RingBufferController<RingCounters> {
        &self.controller
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.controller.capacity_frames()
    }

    /// Samples per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames ready for reading.
    pub fn available_read(&self) -> usize {
        self.controller.available_to_read()
    }

    /// Frames that can be written before reaching the threshold.
    pub fn available_write(&self) -> usize {
        self.controller.available_to_write()
    }

    /// Change the producer-visible size, clamped to capacity.
    pub fn set_threshold(&self, threshold: i64) {
        self.controller.set_threshold(threshold);
    }

    /// Timestamp of the last write.
    pub fn last_timestamp_ns(&self) -> u64 {
        self.timestamp_cell().load(Ordering::Acquire)
    }

    fn timestamp_cell(&self) -> &AtomicU64 {
        match self.controller.counters() {
            RingCounters::Mapped(m) => &m.header().last_timestamp_ns,
            RingCounters::Local(_) => &self.local_timestamp_ns,
        }
    }

    /// Two slices covering `frames` frames starting at `start_frame`, split at the wrap point.
    ///
    /// # Safety
    /// The region must be owned by the caller's side of the SPSC protocol.
    unsafe fn regions_mut(&self, start_frame: usize, frames: usize) -> (&mut [f32], &mut [f32]) {
        let capacity = self.capacity_frames();
        // Counters moved outside the SPSC contract can report any occupancy; never map past
        // the sample region.
        let frames = frames.min(capacity);
        let start_frame = start_frame.min(capacity);
        let first_frames = (capacity - start_frame).min(frames);
        let second_frames = frames - first_frames;
        unsafe {
            let first = std::slice::from_raw_parts_mut(
                self.data_ptr.add(start_frame * self.channels),
                first_frames * self.channels,
            );
            let second =
                std::slice::from_raw_parts_mut(self.data_ptr, second_frames * self.channels);
            (first, second)
        }
    }

    /// Push interleaved samples, returning frames written. Writes stop at the threshold.
    pub fn push(&self, samples: &[f32], timestamp_ns: Option<u64>) -> usize {
        let frames = samples.len() / self.channels;
        let frames_to_write = frames.min(self.controller.available_to_write());
        if frames_to_write == 0 {
            return 0;
        }

        let start = self.controller.write_index();
        let (first, second) = unsafe { self.regions_mut(start, frames_to_write) };
        let split = first.len();
        first.copy_from_slice(&samples[..split]);
        second.copy_from_slice(&samples[split..split + second.len()]);

        self.controller.advance_write(frames_to_write);
        let timestamp = timestamp_ns.unwrap_or_else(monotonic_timestamp_ns);
        self.timestamp_cell().store(timestamp, Ordering::Release);
        frames_to_write
    }

    /// Readable data for up to `frames` frames, split at the wrap point.
    ///
    /// Only the consumer may call this; follow with [`Self::advance_read`] once the data has
    /// been used.
    pub fn readable_regions(&self, frames: usize) -> (&[f32], &[f32]) {
        let frames = frames.min(self.available_read());
        if frames == 0 {
            return (&[], &[]);
        }
        let start = self.controller.read_index();
        let (first, second) = unsafe { self.regions_mut(start, frames) };
        (&*first, &*second)
    }

    /// Release frames previously obtained from [`Self::readable_regions`]. Clamped to what is
    /// readable.
    pub fn advance_read(&self, frames: usize) {
        self.controller
            .advance_read(frames.min(self.available_read()));
    }

    /// Pop frames into `out`, returning frames read.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let requested = out.len() / self.channels;
        let (first, second) = self.readable_regions(requested);
        let frames = (first.len() + second.len()) / self.channels;
        if frames == 0 {
            return 0;
        }
        out[..first.len()].copy_from_slice(first);
        out[first.len()..first.len() + second.len()].copy_from_slice(second);
        self.controller.advance_read(frames);
        frames
    }

    /// Drop frames without copying, returning the number discarded.
    pub fn discard(&self, frames: usize) -> usize {
        let frames = frames.min(self.available_read());
        self.controller.advance_read(frames);
        frames
    }

    /// Fill level relative to the threshold (0.0 - 1.0).
    pub fn fill_ratio(&self) -> f32 {
        let threshold = self.controller.threshold_frames();
        if threshold == 0 {
            return 0.0;
        }
        (self.available_read() as f32 / threshold as f32).min(1.0)
    }
}

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Convert a mach host time tick count into nanoseconds.
pub fn host_time_to_ns(host_time: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        if host_time == 0 {
            return 0;
        }
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time
    }
}

/// Monotonic timestamp in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    #[cfg(target_os = "macos")]
    {
        let host_time = unsafe { mach_absolute_time() };
        host_time_to_ns(host_time)
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        START.elapsed().as_nanos() as u64
    }
}
